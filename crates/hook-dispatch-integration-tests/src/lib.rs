//! End-to-end tests for hook-dispatch live under `tests/`.
