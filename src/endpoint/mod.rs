//! Endpoint Resolution Module
//!
//! Turns declarative `(type, key/value pairs)` endpoints into live storage
//! handles. Each node resolves the endpoints of a task independently when its
//! agent starts; a failure here ends that node's participation in the task.
//!
//! ## Built-in Types
//! - **`fs`**: local filesystem, pair `work_dir` names the root directory.
//! - **`memory`**: in-memory object store, pair `name` selects the store.

pub mod fs;
pub mod memory;
pub mod resolver;
pub mod storage;
