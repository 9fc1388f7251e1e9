//! # nzbgrab
//!
//! Binary-newsgroup retrieval engine: fetches every article of an NZB job
//! in parallel across a pool of authenticated NNTP connections, reassembles
//! the original files, verifies and repairs them with PAR2, unpacks the
//! resulting archives, and delivers the payload to a completion directory.
//! Queue and history survive restarts.
//!
//! ## Design
//!
//! - **Library-first**: no CLI or UI; an HTTP adapter embeds the
//!   [`Supervisor`] and calls its operations
//! - **Explicit ownership**: the queue owns its jobs, jobs own their files
//!   and articles, servers own their connections; components are values the
//!   supervisor constructs and passes in
//! - **Event-driven**: consumers subscribe to a broadcast stream, no
//!   polling required
//! - **Crash-safe**: every persisted structure is versioned and written
//!   atomically; a restart restores the queue exactly as last saved
//!
//! ## Quick start
//!
//! ```no_run
//! use nzbgrab::{Config, ServerConfig, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         servers: vec![ServerConfig {
//!             host: "news.example.com".to_string(),
//!             port: 563,
//!             tls: true,
//!             username: Some("user".to_string()),
//!             password: Some("pass".to_string()),
//!             connections: 10,
//!             ..Default::default()
//!         }],
//!         ..Default::default()
//!     };
//!
//!     let engine = Supervisor::start(config).await?;
//!
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("event: {:?}", event);
//!         }
//!     });
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Streaming file assembly from cached articles
pub mod assembler;
/// Bounded in-memory article cache
pub mod cache;
/// Configuration types
pub mod config;
/// Obfuscated filename detection and renaming
pub mod deobfuscation;
/// Download engine dispatcher
pub mod downloader;
/// Error types
pub mod error;
/// Archive extraction
pub mod extraction;
/// History of finished jobs
pub mod history;
/// NNTP connection management
pub mod nntp;
/// Job, file and article model with per-job admin persistence
pub mod nzb;
/// PAR2 parity handling
pub mod parity;
/// Server pool and failover bookkeeping
pub mod pool;
/// Post-processing pipeline
pub mod postproc;
/// Priority-ordered job queue with versioned snapshots
pub mod queue;
/// Retry logic with exponential backoff
pub mod retry;
/// Time-driven actions
pub mod scheduler;
/// Bandwidth limiting with a token bucket
pub mod speed_limiter;
/// Component lifecycle and pause state
pub mod supervisor;
/// Core types and events
pub mod types;
/// Filename hygiene, path collisions, disk space
pub mod utils;

// Re-export the embedding surface
pub use config::{Config, DuplicateAction, ServerConfig};
pub use error::{Error, FetchError, PostProcessError, QueueError, Result};
pub use history::{History, HistoryFilter, HistoryRecord};
pub use supervisor::{AddJobOptions, PauseState, Supervisor};
pub use types::{Event, JobId, JobState, Priority, QueueStats};
