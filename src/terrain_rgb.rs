use rayon::prelude::*;
use std::fmt;
use std::str::FromStr;

use crate::error::{MergeError, Result};

pub const MAPBOX_DEFAULT_INTERVAL: f64 = 0.1;
pub const MAPBOX_DEFAULT_BASE: f64 = -10000.0;

/// Pixel written for nodata elevations, whatever the scheme.
pub const NODATA_PIXEL: [u8; 3] = [0, 0, 0];

const MAPBOX_RANGE: (f32, f32) = (-10000.0, 8900.0);
const TERRARIUM_RANGE: (f32, f32) = (-32768.0, 32767.0);
const MAX_PACKED: f64 = 16_777_215.0;

/// Terrain-RGB packing scheme.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Encoding {
    /// `base + (R·65536 + G·256 + B) · interval`
    Mapbox { interval: f64, base: f64 },
    /// `(R·256 + G + B/256) − 32768`
    Terrarium,
}

impl Default for Encoding {
    fn default() -> Self {
        Encoding::mapbox()
    }
}

impl Encoding {
    pub fn mapbox() -> Self {
        Encoding::Mapbox {
            interval: MAPBOX_DEFAULT_INTERVAL,
            base: MAPBOX_DEFAULT_BASE,
        }
    }

    /// Mapbox with custom parameters; the interval must be positive.
    pub fn mapbox_with(interval: f64, base: f64) -> Result<Self> {
        if !(interval.is_finite() && interval > 0.0) {
            return Err(MergeError::InvalidInterval(interval));
        }
        Ok(Encoding::Mapbox { interval, base })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Mapbox { .. } => "mapbox",
            Encoding::Terrarium => "terrarium",
        }
    }

    /// Elevations outside this range are clipped before encoding.
    pub fn range(&self) -> (f32, f32) {
        match self {
            Encoding::Mapbox { .. } => MAPBOX_RANGE,
            Encoding::Terrarium => TERRARIUM_RANGE,
        }
    }

    /// Quantisation step in metres.
    pub fn step(&self) -> f64 {
        match self {
            Encoding::Mapbox { interval, .. } => *interval,
            Encoding::Terrarium => 1.0 / 256.0,
        }
    }

    pub fn decode(&self, r: u8, g: u8, b: u8) -> f32 {
        let (r, g, b) = (f64::from(r), f64::from(g), f64::from(b));
        let value = match *self {
            Encoding::Mapbox { interval, base } => base + (r * 65536.0 + g * 256.0 + b) * interval,
            Encoding::Terrarium => (r * 256.0 + g + b / 256.0) - 32768.0,
        };
        value as f32
    }

    /// Packs one elevation. NaN maps to [`NODATA_PIXEL`].
    pub fn encode(&self, elevation: f32) -> (u8, u8, u8) {
        if elevation.is_nan() {
            let [r, g, b] = NODATA_PIXEL;
            return (r, g, b);
        }
        let (lo, hi) = self.range();
        let clipped = f64::from(elevation.clamp(lo, hi));

        let packed = match *self {
            Encoding::Mapbox { interval, base } => ((clipped - base) / interval).round(),
            Encoding::Terrarium => ((clipped + 32768.0) * 256.0).round(),
        };
        let packed = packed.clamp(0.0, MAX_PACKED) as u32;

        (
            ((packed >> 16) & 0xFF) as u8,
            ((packed >> 8) & 0xFF) as u8,
            (packed & 0xFF) as u8,
        )
    }

    /// Decodes a packed RGB buffer in one pass, classifying nodata as NaN.
    pub fn decode_pixels(&self, rgb: &[u8], policy: &NodataPolicy) -> Vec<f32> {
        rgb.par_chunks_exact(3)
            .map(|px| {
                let value = self.decode(px[0], px[1], px[2]);
                if policy.is_nodata([px[0], px[1], px[2]], value) {
                    f32::NAN
                } else {
                    value
                }
            })
            .collect()
    }

    /// Encodes elevations into a packed RGB buffer.
    pub fn encode_pixels(&self, elevations: &[f32]) -> Vec<u8> {
        let mut rgb = vec![0u8; elevations.len() * 3];
        rgb.par_chunks_exact_mut(3)
            .zip(elevations.par_iter())
            .for_each(|(px, &elevation)| {
                let (r, g, b) = self.encode(elevation);
                px[0] = r;
                px[1] = g;
                px[2] = b;
            });
        rgb
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mapbox" => Ok(Encoding::mapbox()),
            "terrarium" => Ok(Encoding::Terrarium),
            _ => Err(MergeError::UnknownEncoding(s.to_string())),
        }
    }
}

/// Rules deciding which decoded pixels carry no elevation.
///
/// A pixel is nodata when any enabled rule matches.
#[derive(Debug, Clone, PartialEq)]
pub struct NodataPolicy {
    /// Values below this are nodata.
    pub min_valid: f32,
    /// Raw pixels some datasets use for water or voids.
    pub rgb_sentinels: Vec<[u8; 3]>,
    /// Decoded values that are nodata in a particular source.
    pub values: Vec<f32>,
    /// Treat an exact zero as nodata.
    pub zero_is_nodata: bool,
}

impl Default for NodataPolicy {
    fn default() -> Self {
        Self {
            min_valid: -30000.0,
            rgb_sentinels: vec![[1, 134, 160], [1, 134, 150]],
            values: Vec::new(),
            zero_is_nodata: false,
        }
    }
}

impl NodataPolicy {
    /// Default rules plus the pixel this crate writes for nodata, so that
    /// merged outputs read back with their voids intact.
    pub fn for_encoding(encoding: &Encoding) -> Self {
        let mut policy = Self::default();
        if let Encoding::Mapbox { .. } = encoding {
            policy.rgb_sentinels.push(NODATA_PIXEL);
        }
        policy
    }

    pub fn with_values(mut self, values: impl IntoIterator<Item = f32>) -> Self {
        self.values.extend(values);
        self
    }

    pub fn is_nodata(&self, pixel: [u8; 3], value: f32) -> bool {
        if !value.is_finite() || value < self.min_valid {
            return true;
        }
        if self.zero_is_nodata && value == 0.0 {
            return true;
        }
        if self.rgb_sentinels.contains(&pixel) {
            return true;
        }
        self.values
            .iter()
            .any(|&v| (f64::from(value) - f64::from(v)).abs() <= 1e-9)
    }
}
