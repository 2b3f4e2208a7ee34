//! signalbus 过程宏
//!
//! `#[signal(...)]`：为信号类型生成静态描述（`::signalbus::signal::DescribeSignal`）。
//!
use proc_macro::TokenStream;

mod signal;
mod utils;

/// 信号描述宏
/// - 参数：`name = "..."`（默认取类型名的 snake_case）、`burst_count = N`（默认 1）、
///   `autoflush = true|false`（默认 true）、`order_by = "col desc, id"`（可选）
/// - 为目标类型实现 `DescribeSignal`（`NAME` 常量与 `describe()`）
/// - `burst_count` 与 `order_by` 在编译期校验
#[proc_macro_attribute]
pub fn signal(attr: TokenStream, item: TokenStream) -> TokenStream {
    signal::expand(attr, item)
}
