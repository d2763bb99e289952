//! Design-to-stage calibration.
//!
//! The mapping from chip-layout coordinates to stage coordinates is modeled as a 2-D affine
//! transform (rotation, scale, shear and translation):
//!
//! ```text
//! ┌ sx ┐   ┌ a  b  c ┐ ┌ dx ┐
//! └ sy ┘ = └ d  e  f ┘ │ dy │
//!                      └ 1  ┘
//! ```
//!
//! [`CalibrationEngine`] collects correspondences (a design point and the stage position
//! that aligned it) and solves the six parameters. Both point sets are Hartley-normalized
//! before the solve; the normalized design system is rejected when its condition number
//! exceeds the configured ceiling, so collinear or nearly coincident reference points fail
//! with `Singular` instead of producing a useless matrix. Exactly three correspondences
//! are solved exactly (LU); more are solved in the least-squares sense (SVD).
//!
//! Solved transforms persist as plain text, two whitespace-separated rows of three
//! numbers, written with Rust's shortest round-trip float formatting so a reload
//! reproduces the matrix bit for bit. Loading also accepts the three-row homogeneous form
//! with a `0 0 1` last row.

use crate::error::{GatorError, GatorResult};
use crate::geometry::{Correspondence, DesignPoint, StagePoint};
use nalgebra::{DMatrix, Matrix2, Matrix2x3, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Smallest number of distinct design points that determines an affine transform.
pub const MIN_CORRESPONDENCES: usize = 3;

/// Default ceiling for the condition number of the normalized system.
pub const DEFAULT_MAX_CONDITION: f64 = 1e8;

/// Beyond this the linear part is numerically singular.
const MAX_INVERTIBLE_CONDITION: f64 = 1.0 / f64::EPSILON;

const HOMOGENEOUS_ROW_TOLERANCE: f64 = 1e-12;

// =============================================================================
// AffineTransform
// =============================================================================

/// Invertible 2-D affine map from design to stage coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 6]", into = "[f64; 6]")]
pub struct AffineTransform {
    forward: Matrix2x3<f64>,
    inverse: Matrix2x3<f64>,
    condition: f64,
}

impl AffineTransform {
    /// Build from `[a, b, c, d, e, f]` (row-major 2×3).
    ///
    /// # Errors
    /// - `InvalidParameter` when a value is not finite
    /// - `Singular` when the linear part cannot be inverted
    pub fn from_row_major(values: [f64; 6]) -> GatorResult<Self> {
        if values.iter().any(|v| !v.is_finite()) {
            return Err(GatorError::InvalidParameter(format!(
                "transform coefficients must be finite, got {:?}",
                values
            )));
        }
        let forward = Matrix2x3::from_row_slice(&values);
        let linear: Matrix2<f64> = forward.fixed_view::<2, 2>(0, 0).into_owned();
        let condition = condition_number(linear.singular_values().iter().copied());
        if !(condition <= MAX_INVERTIBLE_CONDITION) {
            return Err(GatorError::Singular { condition });
        }
        let linear_inv = linear
            .try_inverse()
            .ok_or(GatorError::Singular { condition })?;
        let translation_inv = -(linear_inv * forward.column(2));

        let mut inverse = Matrix2x3::zeros();
        inverse.fixed_view_mut::<2, 2>(0, 0).copy_from(&linear_inv);
        inverse.set_column(2, &translation_inv);

        Ok(Self {
            forward,
            inverse,
            condition,
        })
    }

    /// The identity map.
    pub fn identity() -> Self {
        Self {
            forward: Matrix2x3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0),
            inverse: Matrix2x3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0),
            condition: 1.0,
        }
    }

    /// Coefficients `[a, b, c, d, e, f]`.
    pub fn to_row_major(&self) -> [f64; 6] {
        let m = &self.forward;
        [
            m[(0, 0)],
            m[(0, 1)],
            m[(0, 2)],
            m[(1, 0)],
            m[(1, 1)],
            m[(1, 2)],
        ]
    }

    /// The homogeneous 3×3 form (last row `0 0 1`).
    pub fn to_homogeneous(&self) -> Matrix3<f64> {
        let mut h = Matrix3::identity();
        h.fixed_view_mut::<2, 3>(0, 0).copy_from(&self.forward);
        h
    }

    /// Condition number of the linear part.
    pub fn condition_number(&self) -> f64 {
        self.condition
    }

    /// Map a design point to the stage frame.
    pub fn apply(&self, point: DesignPoint) -> StagePoint {
        let v = self.forward * Vector3::new(point.x, point.y, 1.0);
        StagePoint::new(v.x, v.y)
    }

    /// Map a stage point back to the design frame.
    pub fn apply_inverse(&self, point: StagePoint) -> DesignPoint {
        let v = self.inverse * Vector3::new(point.x, point.y, 1.0);
        DesignPoint::new(v.x, v.y)
    }
}

impl TryFrom<[f64; 6]> for AffineTransform {
    type Error = GatorError;

    fn try_from(values: [f64; 6]) -> Result<Self, Self::Error> {
        Self::from_row_major(values)
    }
}

impl From<AffineTransform> for [f64; 6] {
    fn from(transform: AffineTransform) -> Self {
        transform.to_row_major()
    }
}

/// Residual statistics of a solve, in stage units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FitQuality {
    /// Correspondences used
    pub points: usize,
    /// Root-mean-square distance between predicted and observed stage points
    pub rms_residual: f64,
    /// Worst single residual
    pub max_residual: f64,
    /// Condition number of the normalized design system
    pub condition_number: f64,
}

// =============================================================================
// CalibrationEngine
// =============================================================================

/// Calibration session: collected correspondences plus the current transform.
#[derive(Debug, Clone)]
pub struct CalibrationEngine {
    correspondences: Vec<Correspondence>,
    transform: Option<AffineTransform>,
    fit: Option<FitQuality>,
    max_condition: f64,
}

impl Default for CalibrationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CalibrationEngine {
    /// Empty, uncalibrated session.
    pub fn new() -> Self {
        Self {
            correspondences: Vec::new(),
            transform: None,
            fit: None,
            max_condition: DEFAULT_MAX_CONDITION,
        }
    }

    /// Empty session with a custom conditioning ceiling.
    ///
    /// # Errors
    /// `InvalidParameter` unless `max_condition` is finite and at least 1.
    pub fn with_max_condition(max_condition: f64) -> GatorResult<Self> {
        if !(max_condition.is_finite() && max_condition >= 1.0) {
            return Err(GatorError::InvalidParameter(format!(
                "max_condition must be a finite number >= 1, got {}",
                max_condition
            )));
        }
        Ok(Self {
            max_condition,
            ..Self::new()
        })
    }

    /// Condition-number ceiling applied to solves.
    pub fn max_condition(&self) -> f64 {
        self.max_condition
    }

    /// [`rotation_center`] under this engine's conditioning ceiling.
    pub fn rotation_center(
        &self,
        first: (StagePoint, StagePoint),
        second: (StagePoint, StagePoint),
    ) -> GatorResult<StagePoint> {
        rotation_center(first, second, self.max_condition)
    }

    /// Record one correspondence.
    ///
    /// # Errors
    /// `InvalidParameter` when either point is not finite.
    pub fn add_correspondence(&mut self, design: DesignPoint, stage: StagePoint) -> GatorResult<()> {
        design.ensure_finite("design point")?;
        stage.ensure_finite("stage point")?;
        self.correspondences.push(Correspondence::new(design, stage));
        tracing::debug!(%design, %stage, total = self.correspondences.len(), "Correspondence recorded");
        Ok(())
    }

    /// Collected correspondences in insertion order.
    pub fn correspondences(&self) -> &[Correspondence] {
        &self.correspondences
    }

    /// Forget every correspondence. The current transform is kept.
    pub fn clear(&mut self) {
        self.correspondences.clear();
    }

    /// Solve the transform from the collected correspondences and make it current.
    ///
    /// On failure the previously current transform stays in effect.
    ///
    /// # Errors
    /// - `Underdetermined` with fewer than three distinct design points
    /// - `Singular` for degenerate or badly conditioned geometry
    pub fn solve(&mut self) -> GatorResult<AffineTransform> {
        let distinct = distinct_design_points(&self.correspondences);
        if distinct < MIN_CORRESPONDENCES {
            return Err(GatorError::Underdetermined {
                required: MIN_CORRESPONDENCES,
                got: distinct,
            });
        }

        match fit_affine(&self.correspondences, self.max_condition) {
            Ok((transform, fit)) => {
                tracing::info!(
                    points = fit.points,
                    rms_residual = fit.rms_residual,
                    max_residual = fit.max_residual,
                    condition = fit.condition_number,
                    "Calibration solved"
                );
                self.transform = Some(transform);
                self.fit = Some(fit);
                Ok(transform)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Calibration solve rejected; keeping previous transform");
                Err(e)
            }
        }
    }

    /// Install an externally obtained transform.
    pub fn set_transform(&mut self, transform: AffineTransform) {
        self.transform = Some(transform);
        self.fit = None;
    }

    /// The current transform.
    pub fn current(&self) -> Option<&AffineTransform> {
        self.transform.as_ref()
    }

    /// Homogeneous 3×3 matrix of the current transform.
    pub fn transform_matrix(&self) -> Option<Matrix3<f64>> {
        self.transform.as_ref().map(AffineTransform::to_homogeneous)
    }

    /// Residuals of the last successful solve. `None` after loading.
    pub fn fit_quality(&self) -> Option<FitQuality> {
        self.fit
    }

    /// True once a transform was solved, loaded or set.
    pub fn is_calibrated(&self) -> bool {
        self.transform.is_some()
    }

    /// Map a design point to stage coordinates.
    ///
    /// # Errors
    /// `Uncalibrated` before any transform exists.
    pub fn transform(&self, point: DesignPoint) -> GatorResult<StagePoint> {
        self.transform
            .as_ref()
            .map(|t| t.apply(point))
            .ok_or(GatorError::Uncalibrated)
    }

    /// Map a stage point to design coordinates.
    ///
    /// # Errors
    /// `Uncalibrated` before any transform exists.
    pub fn inverse_transform(&self, point: StagePoint) -> GatorResult<DesignPoint> {
        self.transform
            .as_ref()
            .map(|t| t.apply_inverse(point))
            .ok_or(GatorError::Uncalibrated)
    }

    /// Write the current transform to `path`.
    ///
    /// # Errors
    /// `Uncalibrated` before any transform exists, `Io` when writing fails.
    pub fn save(&self, path: impl AsRef<Path>) -> GatorResult<()> {
        let path = path.as_ref();
        let transform = self.transform.as_ref().ok_or(GatorError::Uncalibrated)?;
        std::fs::write(path, format_matrix(transform))
            .map_err(|e| GatorError::io(path.display().to_string(), e))?;
        tracing::info!(path = %path.display(), "Calibration matrix saved");
        Ok(())
    }

    /// Read a transform from `path` and make it current.
    ///
    /// On failure the previously current transform stays in effect.
    ///
    /// # Errors
    /// `Io` when reading fails, `InvalidParameter` for malformed content, `Singular` for
    /// a non-invertible matrix.
    pub fn load(&mut self, path: impl AsRef<Path>) -> GatorResult<AffineTransform> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| GatorError::io(path.display().to_string(), e))?;
        let transform = parse_matrix(&text)
            .and_then(AffineTransform::from_row_major)
            .map_err(|e| match e {
                GatorError::InvalidParameter(msg) => {
                    GatorError::InvalidParameter(format!("{}: {}", path.display(), msg))
                }
                other => other,
            })?;
        self.set_transform(transform);
        tracing::info!(path = %path.display(), "Calibration matrix loaded");
        Ok(transform)
    }
}

/// Text form of a transform: two rows of three numbers.
pub fn format_matrix(transform: &AffineTransform) -> String {
    let [a, b, c, d, e, f] = transform.to_row_major();
    format!("{:e} {:e} {:e}\n{:e} {:e} {:e}\n", a, b, c, d, e, f)
}

/// Parse a saved transform.
///
/// Accepts six numbers (2×3) or nine numbers (3×3 with last row `0 0 1`), separated by
/// whitespace or commas. Blank lines and lines starting with `#` are ignored.
///
/// # Errors
/// `InvalidParameter` for anything else.
pub fn parse_matrix(text: &str) -> GatorResult<[f64; 6]> {
    let values = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .flat_map(|line| {
            line.split(|c: char| c.is_whitespace() || c == ',')
                .filter(|token| !token.is_empty())
        })
        .map(|token| {
            token.parse::<f64>().map_err(|_| {
                GatorError::InvalidParameter(format!("'{}' is not a number", token))
            })
        })
        .collect::<GatorResult<Vec<f64>>>()?;

    match values.len() {
        6 => Ok([values[0], values[1], values[2], values[3], values[4], values[5]]),
        9 => {
            let last_row = [values[6], values[7], values[8]];
            let expected = [0.0, 0.0, 1.0];
            let homogeneous = last_row
                .iter()
                .zip(expected)
                .all(|(got, want)| (got - want).abs() <= HOMOGENEOUS_ROW_TOLERANCE);
            if !homogeneous {
                return Err(GatorError::InvalidParameter(format!(
                    "last row of a 3x3 matrix must be 0 0 1, got {:?}",
                    last_row
                )));
            }
            Ok([values[0], values[1], values[2], values[3], values[4], values[5]])
        }
        n => Err(GatorError::InvalidParameter(format!(
            "expected 6 or 9 matrix values, found {}",
            n
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct CorrespondenceRow {
    design_x: f64,
    design_y: f64,
    stage_x: f64,
    stage_y: f64,
}

/// Read correspondences from CSV with the header `design_x,design_y,stage_x,stage_y`.
///
/// # Errors
/// `InvalidParameter` for malformed rows.
pub fn read_correspondences<R: std::io::Read>(reader: R) -> GatorResult<Vec<Correspondence>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_reader(reader);
    reader
        .deserialize::<CorrespondenceRow>()
        .map(|row| {
            let row = row.map_err(|e| {
                GatorError::InvalidParameter(format!("correspondence file: {}", e))
            })?;
            Ok(Correspondence::new(
                DesignPoint::new(row.design_x, row.design_y),
                StagePoint::new(row.stage_x, row.stage_y),
            ))
        })
        .collect()
}

// =============================================================================
// Rotation centre
// =============================================================================

/// Centre of rotation of the stage, from two features observed before and after the
/// same rotation.
///
/// Each `(before, after)` pair lies on a circle around the centre, so the centre is the
/// intersection of the two perpendicular bisectors.
///
/// # Errors
/// `Singular` when the bisectors are parallel (or a feature did not move), or when the
/// system's condition number exceeds `max_condition`.
pub fn rotation_center(
    first: (StagePoint, StagePoint),
    second: (StagePoint, StagePoint),
    max_condition: f64,
) -> GatorResult<StagePoint> {
    let rows = [first, second].map(|(before, after)| {
        let a = Vector2::new(before.x, before.y);
        let b = Vector2::new(after.x, after.y);
        let normal = 2.0 * (b - a);
        (normal, b.norm_squared() - a.norm_squared())
    });
    let system = Matrix2::new(rows[0].0.x, rows[0].0.y, rows[1].0.x, rows[1].0.y);
    let rhs = Vector2::new(rows[0].1, rows[1].1);

    let condition = condition_number(system.singular_values().iter().copied());
    if !(condition <= max_condition) {
        return Err(GatorError::Singular { condition });
    }
    let centre = system
        .lu()
        .solve(&rhs)
        .ok_or(GatorError::Singular { condition })?;
    Ok(StagePoint::new(centre.x, centre.y))
}

// =============================================================================
// Solver
// =============================================================================

fn distinct_design_points(correspondences: &[Correspondence]) -> usize {
    let mut seen: Vec<DesignPoint> = Vec::with_capacity(correspondences.len());
    for c in correspondences {
        if !seen.contains(&c.design) {
            seen.push(c.design);
        }
    }
    seen.len()
}

fn condition_number(singular_values: impl Iterator<Item = f64>) -> f64 {
    let (min, max) = singular_values.fold((f64::INFINITY, 0.0_f64), |(min, max), s| {
        (min.min(s), max.max(s))
    });
    if min <= 0.0 {
        f64::INFINITY
    } else {
        max / min
    }
}

/// Centre on the centroid and scale to a mean distance of √2.
///
/// Returns the normalized points and `T` with `p_norm = T * p`. `None` when all points
/// coincide.
fn normalize_points(points: &[Vector2<f64>]) -> Option<(Vec<Vector2<f64>>, Matrix3<f64>)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let centroid = points.iter().sum::<Vector2<f64>>() / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    if mean_dist <= f64::EPSILON * centroid.norm().max(1.0) {
        return None;
    }

    let scale = std::f64::consts::SQRT_2 / mean_dist;
    let t = Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    );
    let normalized = points.iter().map(|p| (p - centroid) * scale).collect();
    Some((normalized, t))
}

fn fit_affine(
    correspondences: &[Correspondence],
    max_condition: f64,
) -> GatorResult<(AffineTransform, FitQuality)> {
    let degenerate = GatorError::Singular {
        condition: f64::INFINITY,
    };
    let design: Vec<Vector2<f64>> = correspondences
        .iter()
        .map(|c| Vector2::new(c.design.x, c.design.y))
        .collect();
    let stage: Vec<Vector2<f64>> = correspondences
        .iter()
        .map(|c| Vector2::new(c.stage.x, c.stage.y))
        .collect();
    let (design_n, t_design) = normalize_points(&design).ok_or_else(|| degenerate.clone())?;
    let (stage_n, t_stage) = normalize_points(&stage).ok_or_else(|| degenerate.clone())?;

    let n = correspondences.len();
    let a = DMatrix::from_fn(n, 3, |r, c| match c {
        0 => design_n[r].x,
        1 => design_n[r].y,
        _ => 1.0,
    });
    let b = DMatrix::from_fn(n, 2, |r, c| if c == 0 { stage_n[r].x } else { stage_n[r].y });

    let svd = a.clone().svd(true, true);
    let condition = condition_number(svd.singular_values.iter().copied());
    if !(condition <= max_condition) {
        return Err(GatorError::Singular { condition });
    }

    // x is 3x2: column k holds the coefficients producing output coordinate k
    let x = if n == MIN_CORRESPONDENCES {
        a.lu().solve(&b).ok_or(GatorError::Singular { condition })?
    } else {
        svd.solve(&b, f64::EPSILON)
            .map_err(|_| GatorError::Singular { condition })?
    };

    let normalized = Matrix3::new(
        x[(0, 0)],
        x[(1, 0)],
        x[(2, 0)],
        x[(0, 1)],
        x[(1, 1)],
        x[(2, 1)],
        0.0,
        0.0,
        1.0,
    );
    let t_stage_inv = t_stage.try_inverse().ok_or_else(|| degenerate.clone())?;
    let h = t_stage_inv * normalized * t_design;
    let transform = AffineTransform::from_row_major([
        h[(0, 0)],
        h[(0, 1)],
        h[(0, 2)],
        h[(1, 0)],
        h[(1, 1)],
        h[(1, 2)],
    ])?;
    if !(transform.condition_number() <= max_condition) {
        return Err(GatorError::Singular {
            condition: transform.condition_number(),
        });
    }

    let residuals: Vec<f64> = correspondences
        .iter()
        .map(|c| transform.apply(c.design).distance_to(&c.stage))
        .collect();
    let rms_residual = (residuals.iter().map(|r| r * r).sum::<f64>() / n as f64).sqrt();
    let max_residual = residuals.iter().copied().fold(0.0, f64::max);

    Ok((
        transform,
        FitQuality {
            points: n,
            rms_residual,
            max_residual,
            condition_number: condition,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(points: &[((f64, f64), (f64, f64))]) -> CalibrationEngine {
        let mut engine = CalibrationEngine::new();
        for &((dx, dy), (sx, sy)) in points {
            engine
                .add_correspondence(DesignPoint::new(dx, dy), StagePoint::new(sx, sy))
                .unwrap();
        }
        engine
    }

    #[test]
    fn uncalibrated_until_solved() {
        let engine = CalibrationEngine::new();
        assert_eq!(
            engine.transform(DesignPoint::new(0.0, 0.0)),
            Err(GatorError::Uncalibrated)
        );
        assert_eq!(
            engine.inverse_transform(StagePoint::new(0.0, 0.0)),
            Err(GatorError::Uncalibrated)
        );
    }

    #[test]
    fn duplicates_do_not_count_as_distinct() {
        let mut engine = engine_with(&[
            ((0.0, 0.0), (1.0, 1.0)),
            ((0.0, 0.0), (1.0, 1.0)),
            ((1.0, 0.0), (2.0, 1.0)),
        ]);
        assert_eq!(
            engine.solve(),
            Err(GatorError::Underdetermined {
                required: 3,
                got: 2
            })
        );
    }

    #[test]
    fn rejects_non_finite_input() {
        let mut engine = CalibrationEngine::new();
        assert!(engine
            .add_correspondence(DesignPoint::new(f64::INFINITY, 0.0), StagePoint::new(0.0, 0.0))
            .is_err());
        assert!(engine.correspondences().is_empty());
    }

    #[test]
    fn failed_solve_keeps_previous_transform() {
        let mut engine = engine_with(&[
            ((0.0, 0.0), (10.0, 20.0)),
            ((1.0, 0.0), (20.0, 20.0)),
            ((0.0, 1.0), (10.0, 30.0)),
        ]);
        let solved = engine.solve().unwrap();
        assert_eq!(engine.transform_matrix(), Some(solved.to_homogeneous()));

        engine.clear();
        for i in 0..3 {
            let t = f64::from(i);
            engine
                .add_correspondence(DesignPoint::new(t, t), StagePoint::new(t, t))
                .unwrap();
        }
        assert!(matches!(engine.solve(), Err(GatorError::Singular { .. })));
        assert_eq!(engine.current(), Some(&solved));
    }

    #[test]
    fn collinear_stage_points_are_singular() {
        let mut engine = engine_with(&[
            ((0.0, 0.0), (0.0, 0.0)),
            ((1.0, 0.0), (1.0, 0.0)),
            ((0.0, 1.0), (2.0, 0.0)),
        ]);
        assert!(matches!(engine.solve(), Err(GatorError::Singular { .. })));
    }

    #[test]
    fn least_squares_reports_residuals() {
        let mut engine = engine_with(&[
            ((0.0, 0.0), (0.0, 0.0)),
            ((1.0, 0.0), (1.0, 0.0)),
            ((0.0, 1.0), (0.0, 1.0)),
            ((1.0, 1.0), (1.01, 1.0)),
        ]);
        engine.solve().unwrap();
        let fit = engine.fit_quality().unwrap();
        assert_eq!(fit.points, 4);
        assert!(fit.rms_residual > 0.0);
        assert!(fit.max_residual < 0.01);
        assert!(fit.max_residual >= fit.rms_residual);
    }

    #[test]
    fn parses_both_matrix_forms() {
        let two_rows = "1e0 0e0 5e0\n0e0 2e0 -3e0\n";
        assert_eq!(parse_matrix(two_rows).unwrap(), [1.0, 0.0, 5.0, 0.0, 2.0, -3.0]);

        let numpy = "# saved by numpy\n\
            1.000000000000000000e+00 0.000000000000000000e+00 5.000000000000000000e+00\n\
            0.000000000000000000e+00 2.000000000000000000e+00 -3.000000000000000000e+00\n\
            0.000000000000000000e+00 0.000000000000000000e+00 1.000000000000000000e+00\n";
        assert_eq!(parse_matrix(numpy).unwrap(), [1.0, 0.0, 5.0, 0.0, 2.0, -3.0]);

        assert!(parse_matrix("1 0 0\n0 1 0\n1 0 1\n").is_err());
        assert!(parse_matrix("1 0 0\n0 1\n").is_err());
        assert!(parse_matrix("1 0 0\n0 x 0\n").is_err());
    }

    #[test]
    fn singular_matrix_is_rejected() {
        assert!(matches!(
            AffineTransform::from_row_major([1.0, 2.0, 0.0, 2.0, 4.0, 0.0]),
            Err(GatorError::Singular { .. })
        ));
        assert!(AffineTransform::from_row_major([f64::NAN, 0.0, 0.0, 0.0, 1.0, 0.0]).is_err());
    }

    #[test]
    fn homogeneous_form_has_unit_last_row() {
        let t = AffineTransform::from_row_major([2.0, 0.0, 1.0, 0.0, 3.0, -1.0]).unwrap();
        let h = t.to_homogeneous();
        assert_eq!(h[(2, 0)], 0.0);
        assert_eq!(h[(2, 1)], 0.0);
        assert_eq!(h[(2, 2)], 1.0);
        assert_eq!(h[(0, 2)], 1.0);
        assert_eq!(h[(1, 1)], 3.0);
    }

    #[test]
    fn serde_uses_flat_array() {
        let t = AffineTransform::from_row_major([2.0, 0.0, 1.0, 0.0, 3.0, -1.0]).unwrap();
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "[2.0,0.0,1.0,0.0,3.0,-1.0]");
        let back: AffineTransform = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
        assert!(serde_json::from_str::<AffineTransform>("[0,0,0,0,0,0]").is_err());
    }

    #[test]
    fn reads_correspondence_csv() {
        let csv = "design_x, design_y, stage_x, stage_y\n\
                   # corner marks\n\
                   0, 0, 10.5, 20.25\n\
                   100, 0, 10.6, 20.25\n";
        let points = read_correspondences(csv.as_bytes()).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].design, DesignPoint::new(100.0, 0.0));
        assert_eq!(points[0].stage, StagePoint::new(10.5, 20.25));

        assert!(read_correspondences("design_x,design_y,stage_x,stage_y\n1,2,three,4\n".as_bytes()).is_err());
    }

    #[test]
    fn rotation_center_from_bisectors() {
        // 90 degree rotation about (5, 5)
        let centre = rotation_center(
            (StagePoint::new(6.0, 5.0), StagePoint::new(5.0, 6.0)),
            (StagePoint::new(5.0, 3.0), StagePoint::new(7.0, 5.0)),
            DEFAULT_MAX_CONDITION,
        )
        .unwrap();
        assert!((centre.x - 5.0).abs() < 1e-12);
        assert!((centre.y - 5.0).abs() < 1e-12);
    }

    #[test]
    fn rotation_center_parallel_bisectors() {
        let still = StagePoint::new(1.0, 1.0);
        assert!(matches!(
            rotation_center(
                (still, still),
                (StagePoint::new(5.0, 3.0), StagePoint::new(7.0, 5.0)),
                DEFAULT_MAX_CONDITION,
            ),
            Err(GatorError::Singular { .. })
        ));
    }

    #[test]
    fn rotation_center_uses_engine_ceiling() {
        let origin = StagePoint::new(0.0, 0.0);
        let first = (origin, StagePoint::new(1.0, 0.0));
        let second = (origin, StagePoint::new(1.0, 1e-9));

        assert!(matches!(
            CalibrationEngine::new().rotation_center(first, second),
            Err(GatorError::Singular { condition }) if condition > 1e8
        ));
        let lenient = CalibrationEngine::with_max_condition(1e12).unwrap();
        assert_eq!(lenient.max_condition(), 1e12);
        let centre = lenient.rotation_center(first, second).unwrap();
        assert!((centre.x - 0.5).abs() < 1e-6);
    }
}
