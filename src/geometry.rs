//! Coordinate types for the two frames the system translates between.
//!
//! `DesignPoint` lives in the chip layout's native coordinates, `StagePoint` in the motion
//! stage's native units. They share a representation but are distinct types with no
//! conversion between them: the only way from one to the other is through a solved [`AffineTransform`](crate::calibration::AffineTransform).

use crate::error::{GatorError, GatorResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! planar_point {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
        pub struct $name {
            /// Horizontal coordinate
            pub x: f64,
            /// Vertical coordinate
            pub y: f64,
        }

        impl $name {
            /// Create a point from its coordinates.
            pub const fn new(x: f64, y: f64) -> Self {
                Self { x, y }
            }

            /// True when both coordinates are finite.
            pub fn is_finite(&self) -> bool {
                self.x.is_finite() && self.y.is_finite()
            }

            /// Euclidean distance to another point in the same frame.
            pub fn distance_to(&self, other: &Self) -> f64 {
                (self.x - other.x).hypot(self.y - other.y)
            }

            pub(crate) fn ensure_finite(&self, what: &str) -> GatorResult<()> {
                if self.is_finite() {
                    Ok(())
                } else {
                    Err(GatorError::InvalidParameter(format!(
                        "{} ({}, {}) is not finite",
                        what, self.x, self.y
                    )))
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "({}, {})", self.x, self.y)
            }
        }
    };
}

planar_point!(
    /// A position in chip-layout (design) coordinates.
    DesignPoint
);

planar_point!(
    /// A physical position of the X/Y stage axes.
    StagePoint
);

/// A paired observation of one design coordinate and the stage position that put it in
/// the crosshairs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    /// Feature location in the layout
    pub design: DesignPoint,
    /// Stage position when the feature was aligned
    pub stage: StagePoint,
}

impl Correspondence {
    /// Pair a design point with a stage point.
    pub const fn new(design: DesignPoint, stage: StagePoint) -> Self {
        Self { design, stage }
    }
}

/// A motorized degree of freedom of the stage.
///
/// Ordered `[x, y, z, theta, phi, psi]`, matching how positions are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Linear x
    X,
    /// Linear y
    Y,
    /// Linear z (focus)
    Z,
    /// Rotation about z
    Theta,
    /// Rotation about x
    Phi,
    /// Rotation about y
    Psi,
}

impl Axis {
    /// All axes in reporting order.
    pub const ALL: [Axis; 6] = [Axis::X, Axis::Y, Axis::Z, Axis::Theta, Axis::Phi, Axis::Psi];

    /// Lowercase axis name.
    pub fn name(&self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
            Axis::Theta => "theta",
            Axis::Phi => "phi",
            Axis::Psi => "psi",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Axis {
    type Err = GatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Axis::ALL
            .into_iter()
            .find(|axis| axis.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| GatorError::InvalidParameter(format!("Unknown axis '{}'", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_names_round_trip() {
        for axis in Axis::ALL {
            assert_eq!(axis.name().parse::<Axis>().unwrap(), axis);
        }
        assert_eq!("THETA".parse::<Axis>().unwrap(), Axis::Theta);
        assert!("w".parse::<Axis>().is_err());
    }

    #[test]
    fn non_finite_points_are_rejected() {
        assert!(DesignPoint::new(1.0, 2.0).ensure_finite("design").is_ok());
        let err = StagePoint::new(f64::NAN, 0.0).ensure_finite("stage").unwrap_err();
        assert!(matches!(err, GatorError::InvalidParameter(_)));
    }

    #[test]
    fn distance_is_euclidean() {
        let a = StagePoint::new(0.0, 0.0);
        let b = StagePoint::new(3.0, 4.0);
        assert_eq!(a.distance_to(&b), 5.0);
    }
}
