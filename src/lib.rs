//! Cross-crate integration tests for the accelmem workspace live in `tests/`.
