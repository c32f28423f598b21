//! Transpool
//!
//! Worker-pool orchestration for a downloadable transcoding executable.
//!
//! A [`TranscodeSession`] downloads the executable payload (reporting
//! byte-level progress), spawns a fixed pool of worker units from it, and
//! dispatches one job per available unit. Large inputs are streamed in
//! bounded-size chunks, results are correlated by worker identity under
//! concurrent dispatch, and every notification flows through one broadcast
//! [`EventBus`].
//!
//! The transcoding executable is opaque. A [`WorkerEngine`] implementation
//! decides how worker instances of it are actually run; [`ProcessEngine`]
//! ships one that spawns child processes speaking JSON lines over stdio.
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use transpool::{ByteSource, ProcessEngine, SessionConfig, TranscodeSession};
//!
//! # async fn demo() -> transpool::PoolResult<()> {
//! let engine = ProcessEngine::new("/tmp/transpool".into());
//! let session = TranscodeSession::new(engine, SessionConfig::default());
//!
//! session.load("https://example.com/transcoder.bin").await?;
//!
//! let source = ByteSource::File("/videos/take1.mp4".into());
//! let result = session
//!     .clip_frame(&source, 42, &CancellationToken::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod loader;
pub mod pool;
pub mod process;
pub mod protocol;
pub mod session;
pub mod types;

pub use chunk::{read_file_in_chunks, read_in_chunks, DEFAULT_CHUNK_SIZE};
pub use dispatch::{ByteSource, Dispatcher, Job};
pub use engine::{WorkerChannels, WorkerEngine};
pub use error::{PoolError, PoolResult};
pub use events::{EventBus, PoolEvent, ProgressStream, ResultStream, Subscription};
pub use loader::Loader;
pub use pool::{PoolHandle, WorkerPool, WorkerUnit};
pub use process::ProcessEngine;
pub use protocol::{InputBuffer, OutputArtifact, RunCommand, WorkerMessage};
pub use session::{SessionConfig, TranscodeSession};
pub use types::{artifact_stem, ProgressUpdate, ResultMap, WorkerId};
