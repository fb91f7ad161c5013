//! Detection records and their geometry
//!
//! A [`MatchData`] is one detected object in camera-relative coordinates
//! (meters, +z forward, +x right, +y down). Records travel on the wire as
//! fixed 14-byte blocks:
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┬─────────────┐
//! │ x (f32)  │ y (f32)  │ z (f32)  │ complete │ fiducial id │
//! │ BE       │ BE       │ BE       │ u8       │ u8, 0=none  │
//! └──────────┴──────────┴──────────┴──────────┴─────────────┘
//! ```

use crate::frame::Frame;
use rand::Rng;

/// Degrees in a radian, as f32
const RAD_TO_DEG: f32 = 180.0 / std::f32::consts::PI;

/// One detected object
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchData {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Whether the whole object is in view
    pub complete: bool,
    /// Fiducial marker id, if the object carries one. Id 0 cannot be
    /// represented on the wire and reads back as `None`.
    pub fiducial_id: Option<u8>,
}

impl MatchData {
    /// Encoded size of one record
    pub const BYTE_LENGTH: usize = 14;

    pub fn new(x: f32, y: f32, z: f32, complete: bool, fiducial_id: Option<u8>) -> Self {
        Self {
            x,
            y,
            z,
            complete,
            fiducial_id,
        }
    }

    /// Project a pixel-space match of known physical size into camera space.
    ///
    /// `(u, v)` is the match center and `match_size` its (width, height) in
    /// pixels. Square pixels are assumed for depth.
    pub fn from_2d(
        u: f32,
        v: f32,
        match_size: (f32, f32),
        context: &MatchContext,
        complete: bool,
        fiducial_id: Option<u8>,
    ) -> Self {
        let (px, py) = match_size;
        let (cx, cy) = context.center;
        let (fx, _) = context.focal;
        let (wx, wy) = context.item_size;

        Self {
            x: (u - cx) * wx / px,
            y: (v - cy) * wy / py,
            z: wx * fx / px,
            complete,
            fiducial_id,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_partial(&self) -> bool {
        !self.complete
    }

    /// Big-endian wire encoding
    pub fn to_bytes(&self) -> [u8; Self::BYTE_LENGTH] {
        let mut out = [0u8; Self::BYTE_LENGTH];
        out[0..4].copy_from_slice(&self.x.to_be_bytes());
        out[4..8].copy_from_slice(&self.y.to_be_bytes());
        out[8..12].copy_from_slice(&self.z.to_be_bytes());
        out[12] = self.complete as u8;
        out[13] = self.fiducial_id.unwrap_or(0);
        out
    }

    /// Decode one record. Returns `None` if `bytes` is too short.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::BYTE_LENGTH {
            return None;
        }
        let f32_at = |i: usize| f32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Some(Self {
            x: f32_at(0),
            y: f32_at(4),
            z: f32_at(8),
            complete: bytes[12] != 0,
            fiducial_id: match bytes[13] {
                0 => None,
                id => Some(id),
            },
        })
    }
}

/// Camera intrinsics plus the physical size of the tracked object
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchContext {
    /// Principal point (cx, cy) in pixels
    pub center: (f32, f32),
    /// Focal lengths (fx, fy) in pixels
    pub focal: (f32, f32),
    /// Object (width, height) in meters
    pub item_size: (f32, f32),
}

/// Calibration of the tag camera with a 6.5 inch tag
pub const APRILTAG_CONTEXT: MatchContext = MatchContext {
    center: (307.727_8, 173.551_62),
    focal: (357.732_27, 356.447_33),
    item_size: (DetectionKind::AprilTag.real_size(), DetectionKind::AprilTag.real_size()),
};

/// Kind of tracked object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectionKind {
    /// 14 inch game piece seen by the wide camera
    GamePiece,
    /// 6.5 inch AprilTag seen by the fisheye camera
    AprilTag,
}

impl DetectionKind {
    /// Physical object size in meters
    pub const fn real_size(self) -> f32 {
        match self {
            DetectionKind::GamePiece => 0.3556,
            DetectionKind::AprilTag => 0.1651,
        }
    }

    /// Horizontal and vertical field of view of the camera used for this kind, degrees
    pub const fn field_of_view(self) -> (f32, f32) {
        match self {
            DetectionKind::GamePiece => (65.368, 36.770),
            DetectionKind::AprilTag => (136.0, 102.0),
        }
    }

    /// Projection context, where a calibration exists
    pub fn context(self) -> Option<MatchContext> {
        match self {
            DetectionKind::GamePiece => None,
            DetectionKind::AprilTag => Some(APRILTAG_CONTEXT),
        }
    }
}

/// A record tagged with what it is a detection of
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub kind: DetectionKind,
    pub record: MatchData,
}

impl Detection {
    pub fn new(kind: DetectionKind, record: MatchData) -> Self {
        Self { kind, record }
    }

    /// Whether the record lies inside the kind's field of view
    pub fn in_view(&self) -> bool {
        let (h_fov, v_fov) = self.kind.field_of_view();
        match (yaw(&self.record), pitch(&self.record)) {
            (Some(yaw), Some(pitch)) => yaw.abs() <= h_fov / 2.0 && pitch.abs() <= v_fov / 2.0,
            _ => false,
        }
    }
}

/// Horizontal angle to the object in degrees, positive to the right
pub fn yaw(record: &MatchData) -> Option<f32> {
    if record.is_partial() {
        return None;
    }
    Some(record.x.atan2(record.z) * RAD_TO_DEG)
}

/// Vertical angle to the object in degrees, positive up
pub fn pitch(record: &MatchData) -> Option<f32> {
    if record.is_partial() {
        return None;
    }
    Some((-record.y).atan2(record.z) * RAD_TO_DEG)
}

/// Straight-line distance to the object in meters
pub fn distance(record: &MatchData) -> Option<f32> {
    if record.is_partial() {
        return None;
    }
    Some((record.x * record.x + record.y * record.y + record.z * record.z).sqrt())
}

/// Camera-relative position (x, y, z) in meters
pub fn position(record: &MatchData) -> Option<[f32; 3]> {
    if record.is_partial() {
        return None;
    }
    Some([record.x, record.y, record.z])
}

/// Random detections for exercising clients without a real detector.
///
/// Produces between one and `max_count` records (at least one) scattered in
/// front of the camera. About one in 256 gets no fiducial id.
pub fn random_matches<R: Rng>(rng: &mut R, max_count: usize) -> Vec<MatchData> {
    let count = rng.random_range(1..=max_count.max(1));
    (0..count)
        .map(|_| {
            let fiducial = rng.random_range(0..=255u8);
            MatchData {
                x: rng.random_range(-2.0..2.0),
                y: rng.random_range(-1.0..1.0),
                z: rng.random_range(0.2..6.0),
                complete: rng.random_bool(0.5),
                fiducial_id: (fiducial != 0).then_some(fiducial),
            }
        })
        .collect()
}

/// Detector closure producing [`random_matches`] for every frame
pub fn demo_detector(max_count: usize) -> impl Fn(&Frame) -> Vec<MatchData> + Send + Sync + 'static {
    move |_frame: &Frame| random_matches(&mut rand::rng(), max_count)
}

/// Visualizer outlining each complete detection's projected center on the frame
pub fn mark_detections(mut frame: Frame, matches: &[MatchData], context: &MatchContext) -> Frame {
    const COMPLETE: [u8; 3] = [0, 255, 63];
    const PARTIAL: [u8; 3] = [0, 255, 255];
    const HALF: i64 = 3;

    let (width, height) = frame.size();
    for m in matches {
        if m.z <= 0.0 {
            continue;
        }
        let u = (m.x * context.focal.0 / m.z + context.center.0).round() as i64;
        let v = (m.y * context.focal.1 / m.z + context.center.1).round() as i64;
        let color = if m.complete { COMPLETE } else { PARTIAL };
        for dy in -HALF..=HALF {
            for dx in -HALF..=HALF {
                if dx.abs() != HALF && dy.abs() != HALF {
                    continue;
                }
                let (x, y) = (u + dx, v + dy);
                if x >= 0 && y >= 0 && (x as u32) < width && (y as u32) < height {
                    frame.set_pixel(x as u32, y as u32, color);
                }
            }
        }
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_record_byte_layout() {
        let record = MatchData::new(1.0, -2.5, 3.25, true, Some(7));
        let bytes = record.to_bytes();
        assert_eq!(&bytes[0..4], &1.0f32.to_be_bytes());
        assert_eq!(&bytes[4..8], &(-2.5f32).to_be_bytes());
        assert_eq!(&bytes[8..12], &3.25f32.to_be_bytes());
        assert_eq!(bytes[12], 1);
        assert_eq!(bytes[13], 7);
        assert_eq!(MatchData::from_bytes(&bytes), Some(record));
    }

    #[test]
    fn test_missing_fiducial_encodes_as_zero() {
        let record = MatchData::new(0.0, 0.0, 1.0, false, None);
        assert_eq!(record.to_bytes()[13], 0);

        let zero_id = MatchData::new(0.0, 0.0, 1.0, false, Some(0));
        let decoded = MatchData::from_bytes(&zero_id.to_bytes()).unwrap();
        assert_eq!(decoded.fiducial_id, None);
    }

    #[test]
    fn test_from_bytes_short_input() {
        assert!(MatchData::from_bytes(&[0u8; 13]).is_none());
    }

    #[test]
    fn test_from_2d_projection() {
        let context = MatchContext {
            center: (320.0, 240.0),
            focal: (500.0, 500.0),
            item_size: (0.2, 0.2),
        };
        // 100 px wide box, centered 50 px right of center
        let m = MatchData::from_2d(370.0, 240.0, (100.0, 100.0), &context, true, Some(3));
        assert_relative_eq!(m.x, 0.1, epsilon = 1e-6);
        assert_relative_eq!(m.y, 0.0, epsilon = 1e-6);
        assert_relative_eq!(m.z, 1.0, epsilon = 1e-6);
        assert!(m.is_complete());
        assert_eq!(m.fiducial_id, Some(3));
    }

    #[test]
    fn test_apriltag_context() {
        assert_eq!(DetectionKind::AprilTag.context(), Some(APRILTAG_CONTEXT));
        assert_relative_eq!(APRILTAG_CONTEXT.item_size.0, 0.1651);
        assert!(DetectionKind::GamePiece.context().is_none());
    }

    #[test]
    fn test_geometry_partial_is_none() {
        let m = MatchData::new(1.0, 1.0, 1.0, false, None);
        assert!(yaw(&m).is_none());
        assert!(pitch(&m).is_none());
        assert!(distance(&m).is_none());
        assert!(position(&m).is_none());
    }

    #[test]
    fn test_geometry_complete() {
        let m = MatchData::new(1.0, -1.0, 1.0, true, None);
        assert_relative_eq!(yaw(&m).unwrap(), 45.0, epsilon = 1e-4);
        assert_relative_eq!(pitch(&m).unwrap(), 45.0, epsilon = 1e-4);
        assert_relative_eq!(distance(&m).unwrap(), 3.0f32.sqrt(), epsilon = 1e-6);
        assert_eq!(position(&m), Some([1.0, -1.0, 1.0]));
    }

    #[test]
    fn test_detection_in_view() {
        let ahead = Detection::new(
            DetectionKind::GamePiece,
            MatchData::new(0.1, 0.0, 2.0, true, None),
        );
        assert!(ahead.in_view());

        let wide = Detection::new(
            DetectionKind::GamePiece,
            MatchData::new(2.0, 0.0, 1.0, true, None),
        );
        assert!(!wide.in_view());
        let wide_tag = Detection::new(DetectionKind::AprilTag, wide.record);
        assert!(wide_tag.in_view());
    }

    #[test]
    fn test_random_matches_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let matches = random_matches(&mut rng, 10);
            assert!(!matches.is_empty() && matches.len() <= 10);
            assert!(matches.iter().all(|m| m.z > 0.0));
            assert!(matches.iter().all(|m| m.fiducial_id != Some(0)));
        }
        assert_eq!(random_matches(&mut rng, 0).len(), 1);
    }

    #[test]
    fn test_mark_detections_draws_inside_frame() {
        let frame = Frame::filled(640, 360, [0, 0, 0]);
        let m = MatchData::from_2d(300.0, 170.0, (40.0, 40.0), &APRILTAG_CONTEXT, true, None);
        let marked = mark_detections(frame, &[m], &APRILTAG_CONTEXT);
        // outline corner three pixels from the projected center
        assert_eq!(marked.pixel(297, 167), Some([0, 255, 63]));
        assert_eq!(marked.pixel(300, 170), Some([0, 0, 0]));
    }
}
