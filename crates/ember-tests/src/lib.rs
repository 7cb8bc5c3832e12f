//! # ember-tests
//! Shared helpers and mock collaborators for end-to-end tests of the
//! block-production engine.

pub mod helpers;
