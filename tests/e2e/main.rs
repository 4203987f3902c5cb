//! End-to-end tests: real git repositories served over `file://`, a
//! scripted stand-in for latexmk, and the full [`texd_core::CompileService`].

mod harness;
mod scenarios;
