use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::generator::research::ResearchReport;

/// 报告输出
#[allow(async_fn_in_trait)]
pub trait Outlet {
    async fn save(&self, report: &ResearchReport) -> Result<PathBuf>;
}

/// 把报告写为Markdown文件；目标是目录时使用`<run_id>.md`
pub struct DiskOutlet {
    output_path: PathBuf,
}

impl DiskOutlet {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }

    fn target_file(&self, report: &ResearchReport) -> PathBuf {
        if self.output_path.is_dir() {
            self.output_path
                .join(format!("{}.md", sanitize(&report.run_id)))
        } else {
            self.output_path.clone()
        }
    }
}

impl Outlet for DiskOutlet {
    async fn save(&self, report: &ResearchReport) -> Result<PathBuf> {
        let target = self.target_file(report);

        // 确保父目录存在
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("无法创建输出目录: {}", parent.display()))?;
        }

        let mut content = report.report.trim_end().to_string();
        content.push('\n');
        fs::write(&target, content)
            .await
            .with_context(|| format!("无法写入报告: {}", target.display()))?;

        tracing::info!(path = %target.display(), "💾 报告已保存");
        Ok(target)
    }
}

fn sanitize(run_id: &str) -> String {
    run_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// 保存报告到配置的路径
pub async fn save(output_path: &Path, report: &ResearchReport) -> Result<PathBuf> {
    DiskOutlet::new(output_path).save(report).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn report() -> ResearchReport {
        ResearchReport {
            run_id: "run/42".to_string(),
            query: "q".to_string(),
            report: "# Report\n\nbody\n\n\n".to_string(),
            rounds: 1,
            sub_questions: vec![],
            corpus_entries: 1,
            from_checkpoint: false,
        }
    }

    #[tokio::test]
    async fn test_save_to_file_path() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("nested").join("report.md");

        let path = save(&target, &report()).await.unwrap();
        assert_eq!(path, target);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# Report\n\nbody\n");
    }

    #[tokio::test]
    async fn test_save_into_directory_uses_run_id() {
        let dir = TempDir::new().unwrap();

        let path = save(dir.path(), &report()).await.unwrap();
        assert_eq!(path, dir.path().join("run_42.md"));
        assert!(path.exists());
    }
}
