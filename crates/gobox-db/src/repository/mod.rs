//! # Repository Module
//!
//! Database repository implementations for the file-tree store.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Sync engine / query handler                                           │
//! │       │                                                                 │
//! │       │  db.tree().resolve(&NodeRef::path("docs/a.txt"))               │
//! │       ▼                                                                 │
//! │  FileTreeRepository                                                    │
//! │  ├── resolve / get / find_child / children / ancestor_path             │
//! │  ├── insert / move_node / set_parent_id / update_attrs                 │
//! │  ├── set_visibility / purge                                            │
//! │  └── upsert_replica (client mirrors)                                   │
//! │                                                                         │
//! │  SharingRepository                                                     │
//! │  └── find / set                                                        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod sharing;
pub mod tree;
