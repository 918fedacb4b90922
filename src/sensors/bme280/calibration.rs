//! BME280 factory trimming parameters and compensation formulas.
//!
//! The floating point formulas from section 8.1 of the BME280 datasheet
//! (BST-BME280-DS001). Humidity and pressure depend on the fine temperature
//! of the same sample, so [`Calibration::compensate_temperature`] hands out a
//! [`FineTemperature`] that the other two require.

/// Length of the first calibration block at `0x88..=0xA1`.
pub const BLOCK_TP_LEN: usize = 26;
/// Length of the humidity calibration block at `0xE1..=0xE7`.
pub const BLOCK_H_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Calibration {
    pub t1: u16,
    pub t2: i16,
    pub t3: i16,
    pub p1: u16,
    pub p2: i16,
    pub p3: i16,
    pub p4: i16,
    pub p5: i16,
    pub p6: i16,
    pub p7: i16,
    pub p8: i16,
    pub p9: i16,
    pub h1: u8,
    pub h2: i16,
    pub h3: u8,
    pub h4: i16,
    pub h5: i16,
    pub h6: i8,
}

/// Intermediate temperature shared by the humidity and pressure formulas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FineTemperature(f64);

impl FineTemperature {
    pub fn value(self) -> f64 {
        self.0
    }
}

fn u16_at(b: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([b[i], b[i + 1]])
}

fn i16_at(b: &[u8], i: usize) -> i16 {
    i16::from_le_bytes([b[i], b[i + 1]])
}

impl Calibration {
    pub fn parse(tp: &[u8; BLOCK_TP_LEN], h: &[u8; BLOCK_H_LEN]) -> Self {
        // H4 and H5 are 12-bit values sharing the nibbles of 0xE5.
        let h4 = ((h[3] as i8 as i16) << 4) | (h[4] & 0x0F) as i16;
        let h5 = ((h[5] as i8 as i16) << 4) | (h[4] >> 4) as i16;

        Self {
            t1: u16_at(tp, 0),
            t2: i16_at(tp, 2),
            t3: i16_at(tp, 4),
            p1: u16_at(tp, 6),
            p2: i16_at(tp, 8),
            p3: i16_at(tp, 10),
            p4: i16_at(tp, 12),
            p5: i16_at(tp, 14),
            p6: i16_at(tp, 16),
            p7: i16_at(tp, 18),
            p8: i16_at(tp, 20),
            p9: i16_at(tp, 22),
            h1: tp[25],
            h2: i16_at(h, 0),
            h3: h[2],
            h4,
            h5,
            h6: h[6] as i8,
        }
    }

    /// Temperature in °C plus the fine temperature for the same sample.
    ///
    /// `offset` shifts both, so humidity and pressure are compensated
    /// against the corrected temperature.
    pub fn compensate_temperature(&self, adc_t: u32, offset: f64) -> (f64, FineTemperature) {
        let adc = adc_t as f64;
        let t1 = self.t1 as f64;
        let var1 = (adc / 16384.0 - t1 / 1024.0) * self.t2 as f64;
        let d = adc / 131072.0 - t1 / 8192.0;
        let var2 = d * d * self.t3 as f64;
        let temperature = (var1 + var2) / 5120.0 + offset;
        (temperature, FineTemperature(temperature * 5120.0))
    }

    /// Pressure in Pa, `None` if the calibration would divide by zero.
    pub fn compensate_pressure(&self, adc_p: u32, fine: FineTemperature) -> Option<f64> {
        let mut var1 = fine.0 / 2.0 - 64000.0;
        let mut var2 = var1 * var1 * self.p6 as f64 / 32768.0;
        var2 += var1 * self.p5 as f64 * 2.0;
        var2 = var2 / 4.0 + self.p4 as f64 * 65536.0;
        var1 = (self.p3 as f64 * var1 * var1 / 524288.0 + self.p2 as f64 * var1) / 524288.0;
        var1 = (1.0 + var1 / 32768.0) * self.p1 as f64;
        if var1 == 0.0 {
            return None;
        }
        let mut p = 1048576.0 - adc_p as f64;
        p = (p - var2 / 4096.0) * 6250.0 / var1;
        var1 = self.p9 as f64 * p * p / 2147483648.0;
        var2 = p * self.p8 as f64 / 32768.0;
        Some(p + (var1 + var2 + self.p7 as f64) / 16.0)
    }

    /// Relative humidity in %, clamped to [0, 100].
    pub fn compensate_humidity(&self, adc_h: u16, fine: FineTemperature) -> f64 {
        let var = fine.0 - 76800.0;
        let var = (adc_h as f64 - (self.h4 as f64 * 64.0 + self.h5 as f64 / 16384.0 * var))
            * (self.h2 as f64 / 65536.0
                * (1.0
                    + self.h6 as f64 / 67108864.0
                        * var
                        * (1.0 + self.h3 as f64 / 67108864.0 * var)));
        let var = var * (1.0 - self.h1 as f64 * var / 524288.0);
        var.clamp(0.0, 100.0)
    }
}
