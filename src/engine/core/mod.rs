// src/engine/core/mod.rs
// Engine Core モジュール - アクション・マウント・描画

pub mod component;
pub mod control;
pub mod event;
pub mod render;

// 公開API
pub use component::{mount_existing, mount_new};
pub use control::{ControlMethod, invoke_control};
pub use event::{Action, ActionDescriptor, EventPayload, compile_event_listeners};
pub use render::{render_form, render_list_view};
