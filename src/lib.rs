//! Empty on purpose. This crate exists only so the workspace root can own
//! the end-to-end tests under `tests/` — all real functionality lives in
//! the library and runtime crates listed in the workspace manifest.
