//! External delivery channels.
//!
//! Only HTTP webhooks for now; each plugin may configure several endpoints.

pub mod webhook;
