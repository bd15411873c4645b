// ==========================================
// CRM 导入引擎 - 后台批次上下文
// ==========================================
// 职责: 作业共享依赖 / 分块 / 心跳与取消检查
// 模型: 一个批次 = 若干独立分块 + 共享进度计数 + 心跳时间戳，由轮询方读取
// ==========================================

use crate::engine::error::{JobError, JobResult};
use crate::repository::{ImportStore, RecordRepository};
use crate::schema::SchemaRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 作业共享依赖（显式注入，不走全局查找）
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<ImportStore>,
    pub records: Arc<dyn RecordRepository>,
    pub schemas: Arc<SchemaRegistry>,
}

impl JobContext {
    pub fn new(
        store: Arc<ImportStore>,
        records: Arc<dyn RecordRepository>,
        schemas: Arc<SchemaRegistry>,
    ) -> Self {
        Self {
            store,
            records,
            schemas,
        }
    }
}

/// 将升序行号切成连续分块，返回每块的 [首行号, 末行号]
pub fn chunk_ranges(row_numbers: &[i64], chunk_size: usize) -> Vec<(i64, i64)> {
    row_numbers
        .chunks(chunk_size.max(1))
        .filter_map(|chunk| Some((*chunk.first()?, *chunk.last()?)))
        .collect()
}

// ==========================================
// BatchReporter - 心跳 + 取消检查
// ==========================================
#[derive(Clone)]
pub struct BatchReporter {
    store: Arc<ImportStore>,
    session_id: String,
    batch_id: String,
    cancel: Arc<AtomicBool>,
}

impl BatchReporter {
    pub fn new(store: Arc<ImportStore>, session_id: &str, batch_id: &str, cancel: Arc<AtomicBool>) -> Self {
        Self {
            store,
            session_id: session_id.to_string(),
            batch_id: batch_id.to_string(),
            cancel,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// 分块开始前检查取消标记
    pub fn ensure_active(&self) -> JobResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(JobError::Cancelled(self.batch_id.clone()));
        }
        Ok(())
    }

    /// 上报已处理数
    ///
    /// # 返回
    /// - Err(Cancelled): 批次已被取消或被其他批次接管
    pub fn tick(&self, processed: u64) -> JobResult<()> {
        self.ensure_active()?;
        if !self.store.heartbeat(&self.session_id, &self.batch_id, processed)? {
            return Err(JobError::Cancelled(self.batch_id.clone()));
        }
        Ok(())
    }

    pub fn finish(&self) -> JobResult<()> {
        self.store.finish_batch(&self.session_id, &self.batch_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_ranges() {
        let rows: Vec<i64> = (2..=11).collect();
        assert_eq!(chunk_ranges(&rows, 4), vec![(2, 5), (6, 9), (10, 11)]);
        assert_eq!(chunk_ranges(&rows, 0).len(), 10);
        assert!(chunk_ranges(&[], 4).is_empty());
    }
}
