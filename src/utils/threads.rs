use futures::stream::{self, StreamExt};
use std::future::Future;

/// 以最多`max_concurrent`个并发执行任务，任一任务完成即释放槽位
///
/// 返回顺序为完成顺序，调用方不应依赖它。
pub async fn do_parallel_with_limit<F, T>(futures: Vec<F>, max_concurrent: usize) -> Vec<T>
where
    F: Future<Output = T>,
{
    stream::iter(futures)
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await
}
