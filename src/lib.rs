//! ## Flywheel Example:
//!
//! ```rust
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//! use std::thread;
//! use std::time::Duration;
//!
//! use flywheel::TimerBuilder;
//!
//! // Create a timer with mostly default configuration
//! let timer = TimerBuilder::default()
//!     // Tick duration defines the resolution for our timer (all timeouts fire on a tick)
//!     .with_tick_duration(Duration::from_millis(100))
//!     .build()
//!     .unwrap();
//!
//! let fired = Arc::new(AtomicBool::new(false));
//! let flag = fired.clone();
//!
//! // Schedule a one-shot callback; the worker thread is started on first use
//! let timeout = timer
//!     .schedule(Duration::from_millis(150), move |_| flag.store(true, Ordering::SeqCst))
//!     .unwrap();
//!
//! // Wait out the delay plus a couple of ticks of slack
//! thread::sleep(Duration::from_millis(500));
//!
//! assert!(fired.load(Ordering::SeqCst));
//! assert!(timeout.is_expired());
//!
//! // Shutting down hands back whatever neither fired nor was cancelled
//! let unprocessed = timer.stop().unwrap();
//! assert!(unprocessed.is_empty());
//! ```

pub mod error;

mod task;
mod timeout;
mod timer;
mod wheel;
mod worker;

pub use crate::error::{TimerError, TimerResult};
pub use crate::task::TimerTask;
pub use crate::timeout::Timeout;
pub use crate::timer::{Timer, TimerBuilder};
