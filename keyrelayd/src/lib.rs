//! Composition pieces of `keyrelayd`, kept in a library so front ends can
//! reuse the key catalog and the listener runner.

pub mod app;
pub mod catalog;
pub mod handler;
pub mod install;
