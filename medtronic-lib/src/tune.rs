//! Carrier frequency search.
//!
//! Pumps drift a little from the nominal carrier. The search brackets the
//! frequency with the strongest reply by ternary search over a band,
//! treating RSSI as unimodal in frequency.

use tracing::debug;

/// Something that can report reply strength at a carrier frequency.
#[allow(async_fn_in_trait)]
pub trait RssiProbe {
    /// RSSI in dBm of a reply at `hz`, or [`NO_SIGNAL_DBM`](crate::radio::NO_SIGNAL_DBM)
    /// when nothing answers.
    async fn probe(&mut self, hz: u32) -> i32;
}

/// Adapts a plain function of frequency into a probe.
pub struct FnProbe<F>(pub F);

impl<F: FnMut(u32) -> i32> RssiProbe for FnProbe<F> {
    async fn probe(&mut self, hz: u32) -> i32 {
        (self.0)(hz)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchBand {
    pub low: u32,
    pub high: u32,
    /// Stop once the bracket is no wider than this.
    pub precision: u32,
}

impl Default for SearchBand {
    fn default() -> Self {
        Self {
            low: 916_000_000,
            high: 917_000_000,
            precision: 10_000,
        }
    }
}

/// Return the centre of the final bracket.
pub async fn ternary_search<P: RssiProbe>(probe: &mut P, band: SearchBand) -> u32 {
    let (mut low, mut high) = (band.low.min(band.high), band.low.max(band.high));
    let precision = band.precision.max(1);
    while high - low > precision {
        let third = (high - low) / 3;
        if third == 0 {
            break;
        }
        let (a, b) = (low + third, high - third);
        let (ra, rb) = (probe.probe(a).await, probe.probe(b).await);
        debug!("probe {} Hz: {} dBm, {} Hz: {} dBm", a, ra, b, rb);
        if ra < rb {
            low = a;
        } else {
            high = b;
        }
    }
    low + (high - low) / 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::NO_SIGNAL_DBM;

    fn peak_at(center: u32) -> impl FnMut(u32) -> i32 {
        move |hz| -40 - (hz.abs_diff(center) / 1_000) as i32
    }

    #[tokio::test]
    async fn finds_peak() {
        let mut probe = FnProbe(peak_at(916_660_000));
        let hz = ternary_search(&mut probe, SearchBand::default()).await;
        assert!(hz.abs_diff(916_660_000) <= 10_000, "{hz}");
    }

    #[tokio::test]
    async fn counts_probes() {
        let mut calls = 0;
        let mut probe = FnProbe(|hz| {
            calls += 1;
            peak_at(916_300_000)(hz)
        });
        ternary_search(&mut probe, SearchBand::default()).await;
        // 1 MHz down to 10 kHz shrinks by a third per step
        assert!(calls <= 2 * 12, "{calls}");
    }

    #[tokio::test]
    async fn silent_band_still_terminates() {
        let mut probe = FnProbe(|_| NO_SIGNAL_DBM);
        let hz = ternary_search(&mut probe, SearchBand::default()).await;
        assert!((916_000_000..=917_000_000).contains(&hz));
    }

    #[tokio::test]
    async fn band_narrower_than_three_hertz() {
        let band = SearchBand {
            low: 916_000_000,
            high: 916_000_002,
            precision: 1,
        };
        let hz = ternary_search(&mut FnProbe(|_| -50), band).await;
        assert_eq!(hz, 916_000_001);
    }
}
