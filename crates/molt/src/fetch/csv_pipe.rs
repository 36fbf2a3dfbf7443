//! Streaming CSV repartitioner.
//!
//! Rewrites a stream of exported rows into a sequence of output chunks
//! bounded by `flush_size` bytes and (optionally) `flush_rows` rows. A
//! chunk writer is created lazily on the first row of each chunk and closed
//! on flush, so quoted multiline records are never split across chunks.

use std::sync::Arc;

use metrics::counter;
use tracing::info;

use crate::blobstore::{ChunkWriter, Resource};
use crate::dbtable::Name;
use crate::error::{MoltError, Result};
use crate::metrics::FETCH_ROWS_IMPORTED;

const PROGRESS_LOG_EVERY: u64 = 100_000;

/// Factory producing the writer for chunk number `part`.
pub type WriterFactory<'a> = Box<dyn FnMut(u32) -> Result<ChunkWriter> + Send + 'a>;

pub struct CsvPipe<'a> {
    table: Name,
    flush_size: usize,
    flush_rows: usize,

    new_writer: WriterFactory<'a>,
    writer: Option<csv::Writer<ChunkWriter>>,
    resources: Vec<Arc<dyn Resource>>,

    part: u32,
    curr_size: usize,
    curr_rows: usize,
    num_rows: u64,
}

impl<'a> CsvPipe<'a> {
    /// `flush_rows == 0` disables row-based flushing.
    pub fn new(
        table: Name,
        flush_size: usize,
        flush_rows: usize,
        new_writer: WriterFactory<'a>,
    ) -> Self {
        Self {
            table,
            flush_size,
            flush_rows,
            new_writer,
            writer: None,
            resources: Vec::new(),
            part: 0,
            curr_size: 0,
            curr_rows: 0,
            num_rows: 0,
        }
    }

    /// Total rows written so far.
    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    /// Write one row; null cells become empty fields. Flushes when either
    /// threshold is met after the row is written.
    pub async fn write_record(&mut self, record: &[Option<String>]) -> Result<()> {
        let writer = self.maybe_init_writer()?;
        writer.write_record(record.iter().map(|c| c.as_deref().unwrap_or("")))?;
        self.curr_rows += 1;
        self.num_rows += 1;
        counter!(FETCH_ROWS_IMPORTED, "table" => self.table.safe_string()).increment(1);
        if self.num_rows % PROGRESS_LOG_EVERY == 0 {
            info!(num_rows = self.num_rows, table = %self.table, "row import status");
        }
        for cell in record {
            self.curr_size += cell.as_deref().map_or(0, str::len) + 1;
        }

        if self.curr_size > self.flush_size
            || (self.flush_rows > 0 && self.curr_rows >= self.flush_rows)
        {
            self.flush().await?;
        }
        Ok(())
    }

    /// Repartition a whole CSV stream. Multiline quoted records arrive as
    /// single parsed rows, so they stay atomic in the output.
    pub async fn pipe<R: std::io::Read>(&mut self, input: R) -> Result<()> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(input);
        let mut record = csv::StringRecord::new();
        while reader.read_record(&mut record)? {
            let row: Vec<Option<String>> =
                record.iter().map(|cell| Some(cell.to_string())).collect();
            self.write_record(&row).await?;
        }
        Ok(())
    }

    /// Flush the trailing partial chunk and hand back all chunk resources.
    pub async fn finish(mut self) -> Result<Vec<Arc<dyn Resource>>> {
        self.flush().await?;
        Ok(self.resources)
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            let chunk = writer
                .into_inner()
                .map_err(|e| MoltError::Csv(e.into_error().into()))?;
            let resource = chunk.finish().await?;
            self.resources.push(resource);
        }
        self.curr_size = 0;
        self.curr_rows = 0;
        Ok(())
    }

    fn maybe_init_writer(&mut self) -> Result<&mut csv::Writer<ChunkWriter>> {
        if self.writer.is_none() {
            let chunk = (self.new_writer)(self.part)?;
            self.part += 1;
            self.writer = Some(csv::Writer::from_writer(chunk));
        }
        match self.writer.as_mut() {
            Some(writer) => Ok(writer),
            None => Err(MoltError::assertion("csv writer missing after init")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::ChunkSink;
    use crate::compression::Compression;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct CaptureSink {
        chunks: Mutex<Vec<(String, Vec<u8>)>>,
    }

    struct CapturedResource {
        key: String,
    }

    #[async_trait]
    impl Resource for CapturedResource {
        fn key(&self) -> &str {
            &self.key
        }
        fn import_url(&self) -> Result<String> {
            Ok(format!("test://{}", self.key))
        }
        async fn read_all(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn mark_for_cleanup(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ChunkSink for CaptureSink {
        async fn put(&self, key: String, data: Vec<u8>) -> Result<Arc<dyn Resource>> {
            self.chunks.lock().unwrap().push((key.clone(), data));
            Ok(Arc::new(CapturedResource { key }))
        }
    }

    async fn run_pipe(input: &str, flush_size: usize, flush_rows: usize) -> Vec<String> {
        let sink = Arc::new(CaptureSink {
            chunks: Mutex::new(Vec::new()),
        });
        let factory_sink = sink.clone();
        let mut pipe = CsvPipe::new(
            Name::new("test", "test"),
            flush_size,
            flush_rows,
            Box::new(move |part| {
                Ok(ChunkWriter::new(
                    format!("part_{:08}", part),
                    Compression::None,
                    factory_sink.clone(),
                ))
            }),
        );
        pipe.pipe(input.as_bytes()).await.unwrap();
        pipe.finish().await.unwrap();
        let chunks = sink.chunks.lock().unwrap();
        chunks
            .iter()
            .map(|(_, data)| String::from_utf8(data.clone()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_one_big_file() {
        let files = run_pipe("1,abcd,efgh\n2,efgh,\"\"\"\"\n3,%,g\n", 1024, 0).await;
        assert_eq!(files, vec!["1,abcd,efgh\n2,efgh,\"\"\"\"\n3,%,g\n"]);
    }

    #[tokio::test]
    async fn test_split_files() {
        let files = run_pipe("1,a\n2,bbbb\n3,cc\n4,a\n", 4, 0).await;
        assert_eq!(files, vec!["1,a\n2,bbbb\n", "3,cc\n", "4,a\n"]);
    }

    #[tokio::test]
    async fn test_quoted_new_lines_stay_atomic() {
        let files = run_pipe("1,a,\"this is\na\nmultiline part\"\n2,a,c", 4, 0).await;
        assert_eq!(
            files,
            vec!["1,a,\"this is\na\nmultiline part\"\n", "2,a,c\n"]
        );
    }

    #[tokio::test]
    async fn test_flush_after_one_row() {
        let files = run_pipe("1,abcd,efgh\n2,efgh,\"\"\"\"\n3,%,g", 1024, 1).await;
        assert_eq!(
            files,
            vec!["1,abcd,efgh\n", "2,efgh,\"\"\"\"\n", "3,%,g\n"]
        );
    }

    #[tokio::test]
    async fn test_flush_after_two_rows() {
        let files = run_pipe("1,abcd,efgh\n2,efgh,\"\"\"\"\n3,%,g", 1024, 2).await;
        assert_eq!(files, vec!["1,abcd,efgh\n2,efgh,\"\"\"\"\n", "3,%,g\n"]);
    }

    #[tokio::test]
    async fn test_flush_rows_larger_than_input() {
        let files = run_pipe("1,abcd,efgh\n2,efgh,\"\"\"\"\n3,%,g", 1024, 4).await;
        assert_eq!(files, vec!["1,abcd,efgh\n2,efgh,\"\"\"\"\n3,%,g\n"]);
    }

    #[tokio::test]
    async fn test_mixed_flush_size_and_rows() {
        let files = run_pipe("1,abcd,efgh\n2,efgh,\"\"\"\"\n3,%,g\n4,a,b\n", 10, 2).await;
        assert_eq!(
            files,
            vec!["1,abcd,efgh\n", "2,efgh,\"\"\"\"\n3,%,g\n", "4,a,b\n"]
        );
    }

    #[tokio::test]
    async fn test_empty_input_yields_no_chunks() {
        let files = run_pipe("", 4, 0).await;
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_null_cells_written_as_empty() {
        let sink = Arc::new(CaptureSink {
            chunks: Mutex::new(Vec::new()),
        });
        let factory_sink = sink.clone();
        let mut pipe = CsvPipe::new(
            Name::new("test", "test"),
            1024,
            0,
            Box::new(move |part| {
                Ok(ChunkWriter::new(
                    format!("part_{:08}", part),
                    Compression::None,
                    factory_sink.clone(),
                ))
            }),
        );
        pipe.write_record(&[Some("1".into()), None, Some("c".into())])
            .await
            .unwrap();
        pipe.finish().await.unwrap();
        let chunks = sink.chunks.lock().unwrap();
        assert_eq!(String::from_utf8(chunks[0].1.clone()).unwrap(), "1,,c\n");
    }
}
