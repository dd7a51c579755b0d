//! Todo List：目标分解后得到的有序计划，是执行进度的基本单位

pub mod list;

pub use list::{TodoItem, TodoList, TodoStatus};
