//! CSV feed reader
//!
//! Streams rows from any async reader as [`RawRecord`]s, optionally paced to
//! a fixed rate so recorded data can be replayed as a live feed.

use super::adapter::RawRecord;
use crate::core::StreamKind;
use crate::error::SourceError;
use csv_async::{AsyncReader, AsyncReaderBuilder, StringRecord, Trim};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Reads header-prefixed CSV rows into raw records
pub struct CsvRecordReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    stream: StreamKind,
    reader: AsyncReader<R>,
    headers: StringRecord,
    row: StringRecord,
    next_offset: u64,
    rate_per_sec: Option<f64>,
}

impl CsvRecordReader<tokio::fs::File> {
    /// Open a CSV file
    pub async fn open(stream: StreamKind, path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        Self::new(stream, file).await
    }
}

impl<R> CsvRecordReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Wrap a reader and consume its header row
    pub async fn new(stream: StreamKind, input: R) -> Result<Self, SourceError> {
        let mut reader = AsyncReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .create_reader(input);
        let headers = reader.headers().await?.clone();
        debug!(stream = %stream, columns = headers.len(), "Opened CSV feed");

        Ok(Self {
            stream,
            reader,
            headers,
            row: StringRecord::new(),
            next_offset: 0,
            rate_per_sec: None,
        })
    }

    /// Limit replay speed to `rate` records per second
    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate_per_sec = (rate.is_finite() && rate > 0.0).then_some(rate);
        self
    }

    /// Read the next row, `None` at end of input
    pub async fn next_record(&mut self) -> Result<Option<RawRecord>, SourceError> {
        if !self.reader.read_record(&mut self.row).await? {
            return Ok(None);
        }
        let offset = self.next_offset;
        self.next_offset += 1;

        let record = RawRecord::from_pairs(
            self.stream,
            self.headers.iter().zip(self.row.iter()),
        )
        .with_offset(offset);
        Ok(Some(record))
    }

    /// Send every row to `tx` until input ends or `cancel` fires
    ///
    /// Returns the number of records forwarded.
    pub async fn forward(
        mut self,
        tx: mpsc::Sender<RawRecord>,
        cancel: CancellationToken,
    ) -> Result<u64, SourceError> {
        let mut pacer = self.rate_per_sec.map(|rate| {
            let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / rate));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });
        let mut sent = 0u64;

        loop {
            if let Some(interval) = pacer.as_mut() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
            }

            let record = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                record = self.next_record() => record?,
            };
            let Some(record) = record else { break };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = tx.send(record) => {
                    result.map_err(|_| SourceError::ChannelClosed)?;
                }
            }
            sent += 1;
        }

        info!(stream = %self.stream, records = sent, "CSV feed finished");
        Ok(sent)
    }
}
