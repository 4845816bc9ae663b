//! Typed - 型付き Job API
//!
//! payload を JSON として型に decode し、task_type の typo を型で排除する。
//!
//! # 二層構造
//! - **表層（Typed）**: `Job` trait, `Handler<J>` trait - 型安全
//! - **内部（Dyn）**: `TypedModule<J, H>` が `Module` を実装し、registry に入る

pub mod handler;
pub mod job;

pub use self::handler::{Handler, TypedModule};
pub use self::job::Job;
