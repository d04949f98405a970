//! Rigid links between the mirror and its support structure.
//!
//! Each mirror is constrained by 6 links, a mix of actuators and
//! fixed-length rods. A link has two ball joints: one attached to the
//! mirror (`mir_pos`), the other to the support frame (`base_pos`), both
//! given in mm at zero orientation. Adjustable links are commanded in
//! mount units (microsteps); the mount/physical conversion is affine:
//! `mount = offset + steps_per_mm * phys`.

use nalgebra::Vector3;

/// Mount conversion parameters of an adjustable link.
#[derive(Debug, Clone, PartialEq)]
pub struct Adjust {
    pub min_mount: f64,
    pub max_mount: f64,
    /// Actuator scale in mount units per um.
    pub scale: f64,
    /// Mount value when the mirror is at zero orientation.
    pub offset: f64,
    steps_per_mm: f64,
}

impl Adjust {
    pub fn new(min_mount: f64, max_mount: f64, scale: f64, offset: f64) -> Self {
        Adjust {
            min_mount,
            max_mount,
            scale,
            offset,
            steps_per_mm: scale * 1000.0,
        }
    }

    /// Mount length (steps) of the adjustable element at physical length `phys` (mm).
    pub fn mount_from_phys(&self, phys: f64) -> f64 {
        self.offset + self.steps_per_mm * phys
    }

    /// Physical length (mm) of the adjustable element at mount length `mount` (steps).
    pub fn phys_from_mount(&self, mount: f64) -> f64 {
        (mount - self.offset) / self.steps_per_mm
    }

    /// Whether a mount position lies in the allowed range. Conversions
    /// themselves are total; callers enforce range where it matters.
    pub fn mount_in_range(&self, mount: f64) -> bool {
        self.min_mount <= mount && mount <= self.max_mount
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkKind {
    /// Rod of constant length; constrains the mirror.
    Fixed,
    /// The distance between the two ball joints varies: a classic hexapod leg.
    AdjLength(Adjust),
    /// The base joint pistons along the neutral base-to-mirror line
    /// (a lead screw riding a linear bearing).
    AdjBase {
        adjust: Adjust,
        /// Unit vector from base to mirror at neutral orientation.
        piston_dir: Vector3<f64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub base_pos: Vector3<f64>,
    pub mir_pos: Vector3<f64>,
    /// Distance between the pivots at zero orientation.
    pub neutral_length: f64,
    kind: LinkKind,
}

impl Link {
    pub fn fixed(base_pos: Vector3<f64>, mir_pos: Vector3<f64>) -> Self {
        Self::with_kind(base_pos, mir_pos, LinkKind::Fixed)
    }

    pub fn adj_length(
        base_pos: Vector3<f64>,
        mir_pos: Vector3<f64>,
        min_mount: f64,
        max_mount: f64,
        scale: f64,
        offset: f64,
    ) -> Self {
        Self::with_kind(
            base_pos,
            mir_pos,
            LinkKind::AdjLength(Adjust::new(min_mount, max_mount, scale, offset)),
        )
    }

    pub fn adj_base(
        base_pos: Vector3<f64>,
        mir_pos: Vector3<f64>,
        min_mount: f64,
        max_mount: f64,
        scale: f64,
        offset: f64,
    ) -> Self {
        let piston_dir = (mir_pos - base_pos).normalize();
        Self::with_kind(
            base_pos,
            mir_pos,
            LinkKind::AdjBase {
                adjust: Adjust::new(min_mount, max_mount, scale, offset),
                piston_dir,
            },
        )
    }

    fn with_kind(base_pos: Vector3<f64>, mir_pos: Vector3<f64>, kind: LinkKind) -> Self {
        Link {
            base_pos,
            mir_pos,
            neutral_length: (base_pos - mir_pos).norm(),
            kind,
        }
    }

    /// Rebuild this link with new pivots, keeping its kind and mount
    /// parameters. Neutral length and piston direction are recomputed.
    pub fn with_pivots(&self, base_pos: Vector3<f64>, mir_pos: Vector3<f64>) -> Self {
        match &self.kind {
            LinkKind::Fixed => Link::fixed(base_pos, mir_pos),
            LinkKind::AdjLength(adj) => Link::adj_length(
                base_pos,
                mir_pos,
                adj.min_mount,
                adj.max_mount,
                adj.scale,
                adj.offset,
            ),
            LinkKind::AdjBase { adjust, .. } => Link::adj_base(
                base_pos,
                mir_pos,
                adjust.min_mount,
                adjust.max_mount,
                adjust.scale,
                adjust.offset,
            ),
        }
    }

    pub fn kind(&self) -> &LinkKind {
        &self.kind
    }

    pub fn is_adjustable(&self) -> bool {
        !matches!(self.kind, LinkKind::Fixed)
    }

    /// Mount conversion parameters, if this link is adjustable.
    pub fn adjust(&self) -> Option<&Adjust> {
        match &self.kind {
            LinkKind::Fixed => None,
            LinkKind::AdjLength(adj) => Some(adj),
            LinkKind::AdjBase { adjust, .. } => Some(adjust),
        }
    }

    /// Distance from the base pivot to the given mirror-end position (mm).
    /// The link may not be capable of achieving this length.
    pub fn length_from_mir_pos(&self, mir_pos: &Vector3<f64>) -> f64 {
        (self.base_pos - mir_pos).norm()
    }

    /// Physical length (mm) of the adjustable element when the mirror end
    /// is at `mir_pos`.
    ///
    /// For fixed links this is the stretch relative to the neutral length;
    /// a true fixed link has physical length 0, and the nonzero value is
    /// used as the residual in the orientation fit.
    pub fn phys_from_mir_pos(&self, mir_pos: &Vector3<f64>) -> f64 {
        match &self.kind {
            LinkKind::Fixed | LinkKind::AdjLength(_) => {
                self.length_from_mir_pos(mir_pos) - self.neutral_length
            }
            LinkKind::AdjBase { piston_dir, .. } => {
                // Second-order projection of the piston extension along the
                // base axis; trig-free and accurate for small angles.
                let r = mir_pos - self.base_pos;
                let x = r.dot(piston_dir);
                let y_sq = r.cross(piston_dir).norm_squared();
                x + y_sq / (2.0 * self.neutral_length) - self.neutral_length
            }
        }
    }
}
