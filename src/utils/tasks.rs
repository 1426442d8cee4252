//! 命名后台任务
//!
//! 适配器的保活/心跳任务通过这里派生，关闭服务时按名称批量取消。

use parking_lot::Mutex;
use std::future::Future;
use tokio::task::JoinHandle;

struct NamedTask {
    name: String,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<Vec<NamedTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 派生命名任务
    pub fn spawn<F>(&self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        log::debug!("spawn task {}", name);
        let handle = tokio::spawn(future);
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.handle.is_finished());
        tasks.push(NamedTask { name, handle });
    }

    /// 取消名称满足条件的所有未结束任务，返回取消数量
    pub fn abort_where(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut tasks = self.tasks.lock();
        let mut aborted = 0;
        tasks.retain(|t| {
            if t.handle.is_finished() {
                return false;
            }
            if predicate(&t.name) {
                t.handle.abort();
                aborted += 1;
                return false;
            }
            true
        });
        aborted
    }

    /// 未结束任务名称
    pub fn running(&self) -> Vec<String> {
        self.tasks
            .lock()
            .iter()
            .filter(|t| !t.handle.is_finished())
            .map(|t| t.name.clone())
            .collect()
    }
}
