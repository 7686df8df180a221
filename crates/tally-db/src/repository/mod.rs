//! # Repository Module
//!
//! Local store access behind a small typed API.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  EntitySyncer<T>                                                       │
//! │       │                                                                 │
//! │       │  db.records().find_by_external_ref::<Customer>("POS-1")        │
//! │       ▼                                                                 │
//! │  RecordRepository            CursorRepository                          │
//! │  ├── get / find_by_*         ├── get(kind, name)                       │
//! │  ├── list / list_due         └── set(kind, name, at)                   │
//! │  ├── save / save_all                                                   │
//! │  └── hard_delete                                                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite                                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`RecordRepository`](record::RecordRepository) - Synced records of every kind
//! - [`CursorRepository`](cursor::CursorRepository) - Per-domain sync cursors

pub mod cursor;
pub mod record;
