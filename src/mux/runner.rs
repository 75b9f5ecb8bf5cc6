use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_io_async::{Read, Write};

use super::Mux;
use crate::error::Error;

const READ_CHUNK: usize = 64;

/// Receive task of a multiplexer context.
///
/// Exactly one runner may feed a given [`Mux`].
pub struct Runner<
    'a,
    M: RawMutex,
    W: Write,
    const CHANNELS: usize,
    const CHANNEL_BUF: usize,
    const RX_BUF: usize,
> {
    mux: &'a Mux<M, W, CHANNELS, CHANNEL_BUF, RX_BUF>,
}

impl<'a, M: RawMutex, W: Write, const CHANNELS: usize, const CHANNEL_BUF: usize, const RX_BUF: usize>
    Runner<'a, M, W, CHANNELS, CHANNEL_BUF, RX_BUF>
{
    pub fn new(mux: &'a Mux<M, W, CHANNELS, CHANNEL_BUF, RX_BUF>) -> Self {
        Self { mux }
    }

    /// Pump bytes from `reader` into the multiplexer.
    ///
    /// Returns `Ok(())` when the reader reaches end of stream, or the first
    /// transport error.
    pub async fn run<R: Read>(&mut self, mut reader: R) -> Result<(), Error> {
        let mut buf = [0u8; READ_CHUNK];
        let mut start = 0;
        let mut end = 0;

        loop {
            while start < end {
                let accepted = self.mux.on_bytes_received(&buf[start..end]).await?;
                start += accepted;
                if start < end {
                    // Receive ring is full until a channel consumer reads.
                    self.mux.wait_rx_space().await;
                    self.mux.process().await?;
                }
            }

            // Only race the reader while a frame is parked in the ring, so
            // reads are not cancelled needlessly.
            let read = if self.mux.is_stalled().await {
                select(reader.read(&mut buf), self.mux.wait_rx_space()).await
            } else {
                Either::First(reader.read(&mut buf).await)
            };

            match read {
                Either::First(Ok(0)) => {
                    debug!("[MUX] Link reader closed");
                    return Ok(());
                }
                Either::First(Ok(n)) => {
                    start = 0;
                    end = n;
                }
                Either::First(Err(e)) => return Err(Error::transport(e)),
                Either::Second(()) => self.mux.process().await?,
            }
        }
    }
}

impl<M: RawMutex, W: Write, const CHANNELS: usize, const CHANNEL_BUF: usize, const RX_BUF: usize>
    Mux<M, W, CHANNELS, CHANNEL_BUF, RX_BUF>
{
    pub fn runner(&self) -> Runner<'_, M, W, CHANNELS, CHANNEL_BUF, RX_BUF> {
        Runner::new(self)
    }
}
