use crate::config::Config;
use crate::generator::context::ResearchContext;
use crate::generator::research::{ResearchReport, RunRequest, Supervisor};

use anyhow::Result;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// 时间跟踪作用域
pub struct TimingScope {
    start_time: Instant,
    phase_start_times: HashMap<String, Instant>,
    phase_durations: HashMap<String, Duration>,
}

impl Default for TimingScope {
    fn default() -> Self {
        Self::new()
    }
}

impl TimingScope {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            phase_start_times: HashMap::new(),
            phase_durations: HashMap::new(),
        }
    }

    /// 开始一个新的阶段计时
    pub fn start_phase(&mut self, phase_name: &str) {
        self.phase_start_times
            .insert(phase_name.to_string(), Instant::now());
    }

    /// 结束一个阶段的计时
    pub fn end_phase(&mut self, phase_name: &str) -> Option<Duration> {
        let start_time = self.phase_start_times.remove(phase_name)?;
        let duration = start_time.elapsed();
        self.phase_durations
            .insert(phase_name.to_string(), duration);
        Some(duration)
    }

    pub fn total_duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn phase_durations(&self) -> &HashMap<String, Duration> {
        &self.phase_durations
    }

    /// 获取格式化的执行时间报告，阶段按固定顺序输出
    pub fn generate_timing_report(&self) -> String {
        let mut report = format!(
            "总执行时间: {:.2}秒\n",
            self.total_duration().as_secs_f64()
        );

        let phases: Vec<(&str, &Duration)> = TimingKeys::all_phase_keys()
            .into_iter()
            .filter_map(|key| self.phase_durations.get(key).map(|d| (key, d)))
            .collect();
        if !phases.is_empty() {
            report.push_str("\n各阶段执行时间:\n");
            for (phase, duration) in phases {
                report.push_str(&format!("- {}: {:.3}秒\n", phase, duration.as_secs_f64()));
            }
        }

        report
    }
}

/// 时间跟踪常量
pub struct TimingKeys;

impl TimingKeys {
    pub const RESEARCH: &'static str = "research";
    pub const OUTPUT: &'static str = "output";

    /// 获取所有阶段的键列表
    pub fn all_phase_keys() -> Vec<&'static str> {
        vec![Self::RESEARCH, Self::OUTPUT]
    }
}

/// 启动一次深度研究
pub async fn launch(config: &Config, request: &RunRequest) -> Result<ResearchReport> {
    let context = ResearchContext::new(config.clone())?;
    launch_with_context(&context, request).await
}

/// 在给定上下文中执行研究并按配置保存报告
pub async fn launch_with_context(
    context: &ResearchContext,
    request: &RunRequest,
) -> Result<ResearchReport> {
    let mut timing = TimingScope::new();
    tracing::info!(run_id = %request.run_id, query = %request.query, "🚀 开始深度研究");

    timing.start_phase(TimingKeys::RESEARCH);
    let supervisor = Supervisor::new(context)?;
    let report = supervisor.run(request).await?;
    timing.end_phase(TimingKeys::RESEARCH);

    if let Some(output_path) = &context.config.output_path {
        timing.start_phase(TimingKeys::OUTPUT);
        crate::generator::outlet::save(output_path, &report).await?;
        timing.end_phase(TimingKeys::OUTPUT);
    }

    if let Some(cache) = &context.cache {
        let stats = cache.stats();
        tracing::info!(
            hits = stats.hits,
            misses = stats.misses,
            hit_rate = %format!("{:.1}%", stats.hit_rate() * 100.0),
            "📊 检索缓存统计"
        );
    }

    tracing::info!(
        rounds = report.rounds,
        sub_questions = report.sub_questions.len(),
        "✅ 研究完成\n{}",
        timing.generate_timing_report()
    );
    Ok(report)
}
