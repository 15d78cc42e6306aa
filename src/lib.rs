//! Workspace-level package. Exists to host the integration tests in
//! `tests/`; library consumers depend on the member crates (or the
//! `axon` umbrella) directly.
