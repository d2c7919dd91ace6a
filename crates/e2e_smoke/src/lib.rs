//! End-to-end smoke tests for the proxy live under `tests/`.
