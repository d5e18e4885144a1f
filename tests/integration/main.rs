//! Integration tests against in-memory collaborators.

mod scenarios;
mod support;
