use std::io::{self, Write};

use async_trait::async_trait;
use env_logger::Builder;
use log::LevelFilter;
use pingora::{
    server::{ListenFds, ShutdownWatch},
    services::Service,
};
use tokio::{
    fs::{create_dir_all, metadata, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};

use crate::config;

/// `io::Write` end of the log channel handed to env_logger.
pub struct AsyncWriter {
    sender: UnboundedSender<Vec<u8>>,
}

impl Write for AsyncWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sender
            .send(buf.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Background service appending log records to the configured file.
pub struct Logger {
    sender: UnboundedSender<Vec<u8>>,
    receiver: UnboundedReceiver<Vec<u8>>,
    config: config::Log,
}

impl Logger {
    pub fn new(config: config::Log) -> Self {
        let (sender, receiver) = unbounded_channel::<Vec<u8>>();
        Self {
            sender,
            receiver,
            config,
        }
    }

    fn create_async_writer(&self) -> AsyncWriter {
        AsyncWriter {
            sender: self.sender.clone(),
        }
    }

    /// Routes env_logger output into this logger. `RUST_LOG` still applies.
    pub fn init_env_logger(&self) {
        let writer = self.create_async_writer();
        Builder::new()
            .filter_level(LevelFilter::Info)
            .parse_default_env()
            .target(env_logger::Target::Pipe(Box::new(writer)))
            .init();
    }

    async fn open_log_file(&self) -> io::Result<BufWriter<tokio::fs::File>> {
        let log_file_path = &self.config.path;

        if let Some(parent) = std::path::Path::new(log_file_path).parent() {
            if metadata(parent).await.is_err() {
                create_dir_all(parent).await?;
            }
        }

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(log_file_path)
            .await?;
        Ok(BufWriter::new(file))
    }
}

#[async_trait]
impl Service for Logger {
    async fn start_service(&mut self, _fds: Option<ListenFds>, mut shutdown: ShutdownWatch) {
        let mut file = match self.open_log_file().await {
            Ok(file) => file,
            Err(e) => {
                eprintln!("Failed to open log file {}: {e}", self.config.path);
                return;
            }
        };

        loop {
            tokio::select! {
                biased;
                // Shutdown signal handling
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("Shutdown signal received, stopping write log");
                        break;
                    }
                },

                data = self.receiver.recv() => {
                    match data {
                        Some(data) => {
                            if let Err(e) = file.write_all(&data).await {
                                eprintln!("Failed to write to log file: {e}");
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // drain what was queued before shutdown
        while let Ok(data) = self.receiver.try_recv() {
            if let Err(e) = file.write_all(&data).await {
                eprintln!("Failed to write to log file: {e}");
            }
        }

        if let Err(e) = file.flush().await {
            eprintln!("Failed to flush log file: {e}");
        }
    }

    fn name(&self) -> &'static str {
        "log sync"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}
