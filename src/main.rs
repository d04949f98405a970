use std::sync::Arc;

use eyre::{eyre, WrapErr};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mirror_ctrl::actor::{self, ActorCommand, GalilTarget, MirrorCtrl};
use mirror_ctrl::galil::{DeviceSession, GalilHooks, NoHooks, PiezoHooks, UserVerb};
use mirror_ctrl::mirror::presets;
use mirror_ctrl::Config;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config: Config =
        confy::load_path("mirror-ctrl.toml").wrap_err("could not load mirror-ctrl.toml")?;

    let mirror = presets::by_name(&config.mirror).ok_or_else(|| {
        eyre!(
            "unknown mirror preset {:?}; expected one of {:?}",
            config.mirror,
            presets::PRESET_NAMES
        )
    })?;
    let mirror = Arc::new(mirror);
    let piezo = presets::has_piezos(&config.mirror);
    info!(mirror = %mirror.name(), piezo, "controlling mirror");

    let stream = TcpStream::connect((config.galil.host.as_str(), config.galil.port))
        .await
        .wrap_err_with(|| {
            format!(
                "could not connect to the Galil at {}:{}",
                config.galil.host, config.galil.port
            )
        })?;
    info!(host = %config.galil.host, port = config.galil.port, "connected to the Galil");

    let (telemetry, _) = broadcast::channel(256);
    let hooks: Box<dyn GalilHooks> = if piezo {
        Box::new(PiezoHooks)
    } else {
        Box::new(NoHooks)
    };
    let session = DeviceSession::spawn(
        stream,
        mirror.clone(),
        config.galil.max_iter,
        hooks,
        telemetry.clone(),
    );

    let actor = MirrorCtrl::spawn(
        session,
        Some(GalilTarget {
            host: config.galil.host.clone(),
            port: config.galil.port,
            mirror,
            max_iter: config.galil.max_iter,
            piezo,
            telemetry: telemetry.clone(),
        }),
    );

    // Halt the motors and learn the controller state before serving users.
    let startup = actor.run(ActorCommand::Verb(UserVerb::Stop)).await;
    info!(?startup, "startup stop/status sweep finished");

    let listener = TcpListener::bind((config.server.bind.as_str(), config.server.port))
        .await
        .wrap_err("could not bind the user command port")?;
    info!(bind = %config.server.bind, port = config.server.port, "serving user commands");
    actor::serve(listener, actor, telemetry).await?;
    Ok(())
}
