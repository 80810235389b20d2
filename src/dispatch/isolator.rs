//! 任务隔离
//!
//! 把一个工作描述与广播上下文组装成自包含的 IsolatedTask。上下文按值深拷贝，
//! 任务之间、任务与原始上下文之间不存在可变别名。

use crate::dispatch::types::{BroadcastContext, IsolatedTask, TaskId, WorkDescriptor};

/// 构建隔离任务（纯构造，无副作用）
pub fn isolate(id: TaskId, descriptor: WorkDescriptor, context: &BroadcastContext) -> IsolatedTask {
    IsolatedTask {
        id,
        payload: descriptor.into_payload(),
        context: context.clone(),
    }
}

/// 按序号为整轮描述构建隔离任务；描述与任务一一对应
pub fn isolate_all(descriptors: Vec<WorkDescriptor>, context: &BroadcastContext) -> Vec<IsolatedTask> {
    descriptors
        .into_iter()
        .enumerate()
        .map(|(index, descriptor)| isolate(TaskId(index), descriptor, context))
        .collect()
}
