//! # sqlpool
//!
//! Backend-agnostic async connection pool with MRU reuse and idle eviction.
//!
//! Unlike size-capped pools, this implementation grows on demand and shrinks
//! through an idle-age eviction pass that runs on every acquisition, so a
//! burst of load is absorbed without queueing and the surplus ages out on
//! its own once traffic subsides.
//!
//! ## Features
//!
//! - Most-recently-used selection of idle connections for reuse locality
//! - Idle-age eviction on every acquisition (no background timer)
//! - Health-checked acquisition via a backend liveness probe
//! - Atomic-from-the-caller's-perspective replacement of defective
//!   connections
//! - Pluggable backends through the [`ConnectionManager`] strategy trait
//! - Pool status and metrics for observability
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlpool::{ConnectionManager, Pool};
//!
//! let pool = Pool::new(MyManager::connect_to("db.example.com:5432"));
//!
//! // Acquire a connection, use it, hand it back.
//! let conn = pool.grab().await?;
//! // ... run queries ...
//! pool.release(&conn).await;
//!
//! // Acquisition with a liveness probe:
//! let conn = pool.safe_grab().await?;
//!
//! // Replace a connection the protocol layer has flagged as broken:
//! let fresh = pool.exchange(&conn).await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod manager;
pub mod pool;

// Error types
pub use error::PoolError;

// Backend strategy
pub use manager::ConnectionManager;

// Pool types
pub use pool::{Pool, PoolMetrics, PoolStatus};
