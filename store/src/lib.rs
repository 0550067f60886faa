//! `store` is the persistent typed storage engine of a multi-user simulation
//! server. It layers, bottom up:
//!
//! - two byte-level stores over append-only record files with an in-memory
//!   keydir: an unordered [`storage::record::RecordStore`] (`.tkh`) and a
//!   lexically-ordered [`storage::ordered::OrderedStore`] (`.tkt`) with
//!   `first` and ordered cursors;
//! - atomic multi-key read-modify-write transactions
//!   ([`storage::store::Store::proc`]);
//! - a typed façade ([`codec::Typed`]) that encodes and decodes records with
//!   a caller-supplied serializer;
//! - hierarchical subsets inside an ordered store via length-prefixed
//!   composite keys ([`subset`]);
//! - a write-behind cache of hot mutable records with release-hook dirty
//!   tracking and a backing-off background flusher ([`live::LiveCache`]);
//! - a restart-tolerant priority queue of time-scheduled events
//!   ([`queue::EventQueue`]).
//!
//! ## Getting started
//!
//! ```no_run
//! use store::codec::bin::BinCodec;
//! use store::codec::Typed;
//! use store::error::CResult;
//! use store::storage::record::RecordStore;
//! use store::storage::store::Store;
//! use store::storage::Options;
//!
//! fn main() -> CResult<()> {
//!     let store = RecordStore::open("world/objects", Options::record())?;
//!     store.set(b"o1", b"payload", true)?;
//!     assert_eq!(store.get(b"o1")?, b"payload".to_vec());
//!
//!     let typed: Typed<RecordStore, BinCodec<String>> =
//!         Typed::new(RecordStore::open("world/names", Options::record())?, BinCodec::new());
//!     typed.set(b"n1", &"anvil".to_string(), true)?;
//!
//!     typed.close()?;
//!     store.close()?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod storage;
pub mod codec;
pub mod subset;
pub mod live;
pub mod queue;
