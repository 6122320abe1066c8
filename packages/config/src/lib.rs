// ABOUTME: Shared configuration names for the podshim workspace
// ABOUTME: Re-exports environment variable constants consumed by the runtime and sandbox crates

pub mod constants;
