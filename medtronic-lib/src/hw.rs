//! Platform adapter: SPI transfers and the transceiver's interrupt line.
//!
//! Any embedded-hal `SpiDevice` works as the SPI port and any embedded-hal-async
//! `Wait` pin works as the interrupt line. HAL errors are mapped to
//! [`MdtError::SpiFailure`] / [`MdtError::GpioFailure`].

use crate::error::MdtError;
use embedded_hal::digital::Error as _;
use embedded_hal::spi::{Error as _, SpiDevice};
use embedded_hal_async::digital::Wait;
use std::time::Duration;
use tracing::trace;

/// Full-duplex SPI access with chip select handled by the port.
pub trait SpiPort {
    /// Clock `buf` out and replace it with the bytes clocked in.
    fn transfer(&mut self, operation: &'static str, buf: &mut [u8]) -> Result<(), MdtError>;

    /// Single-byte exchange: returns the byte clocked in while `byte` goes out.
    fn transfer_byte(&mut self, operation: &'static str, byte: u8) -> Result<u8, MdtError> {
        let mut buf = [byte];
        self.transfer(operation, &mut buf)?;
        Ok(buf[0])
    }
}

impl<T: SpiDevice> SpiPort for T {
    fn transfer(&mut self, operation: &'static str, buf: &mut [u8]) -> Result<(), MdtError> {
        trace!(operation, out = hex::encode(&*buf), "SPI");
        self.transfer_in_place(buf).map_err(|e| MdtError::SpiFailure {
            operation,
            detail: format!("{:?}", e.kind()),
        })
    }
}

/// Rising-edge wait on the transceiver's interrupt output.
#[allow(async_fn_in_trait)]
pub trait InterruptPin {
    /// Returns `Ok(false)` when `timeout` elapses before an edge.
    async fn await_rising_edge(&mut self, timeout: Duration) -> Result<bool, MdtError>;
}

impl<T: Wait> InterruptPin for T {
    async fn await_rising_edge(&mut self, timeout: Duration) -> Result<bool, MdtError> {
        match tokio::time::timeout(timeout, self.wait_for_rising_edge()).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => Err(MdtError::GpioFailure {
                operation: "wait for rising edge",
                detail: format!("{:?}", e.kind()),
            }),
            Err(_) => Ok(false),
        }
    }
}

/// Placeholder pin type for drivers opened without an interrupt line.
///
/// Drivers never wait on it; they poll the chip instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPin;

impl embedded_hal::digital::ErrorType for NoPin {
    type Error = embedded_hal::digital::ErrorKind;
}

impl Wait for NoPin {
    async fn wait_for_high(&mut self) -> Result<(), Self::Error> {
        std::future::pending().await
    }

    async fn wait_for_low(&mut self) -> Result<(), Self::Error> {
        std::future::pending().await
    }

    async fn wait_for_rising_edge(&mut self) -> Result<(), Self::Error> {
        std::future::pending().await
    }

    async fn wait_for_falling_edge(&mut self) -> Result<(), Self::Error> {
        std::future::pending().await
    }

    async fn wait_for_any_edge(&mut self) -> Result<(), Self::Error> {
        std::future::pending().await
    }
}

/// Linux spidev access.
#[cfg(feature = "linux")]
pub mod linux {
    use crate::error::MdtError;
    pub use linux_embedded_hal::SpidevDevice;
    use linux_embedded_hal::spidev::{SpiModeFlags, SpidevOptions};

    /// SPI clock used for both transceivers.
    pub const SPI_SPEED_HZ: u32 = 6_000_000;

    /// Open and configure `/dev/spidevB.C` for mode 0, 8-bit words.
    pub fn open_spidev(path: &str) -> Result<SpidevDevice, MdtError> {
        let mut spi = SpidevDevice::open(path).map_err(|e| MdtError::SpiFailure {
            operation: "open",
            detail: format!("{path}: {e:?}"),
        })?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(SPI_SPEED_HZ)
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();
        spi.0.configure(&options).map_err(|e| MdtError::SpiFailure {
            operation: "configure",
            detail: format!("{path}: {e:?}"),
        })?;
        Ok(spi)
    }
}
