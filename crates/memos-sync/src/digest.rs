//! Weekly digests: one AI-written review per ISO week, written at most once.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use chrono_tz::Tz;
use memos_ai::AiBackend;
use memos_core::SummaryLanguage;
use memos_storage::Storage;
use tracing::{debug, error, info, warn};

use crate::enrich::is_suitable_for_ai;

/// Divider placed between record bodies handed to the backend.
pub const DIGEST_DIVIDER: &str = "\n---\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WeekKey {
    /// ISO week-numbering year, which can differ from the calendar year.
    pub year: i32,
    pub week: u32,
}

impl WeekKey {
    pub fn of(at: DateTime<Utc>, tz: &Tz) -> Self {
        let iso = at.with_timezone(tz).date_naive().iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }

    pub fn monday(&self) -> Option<NaiveDate> {
        NaiveDate::from_isoywd_opt(self.year, self.week, Weekday::Mon)
    }

    pub fn sunday(&self) -> Option<NaiveDate> {
        NaiveDate::from_isoywd_opt(self.year, self.week, Weekday::Sun)
    }
}

/// A record as seen by the digest pass.
#[derive(Debug, Clone)]
pub struct DigestEntry {
    pub identity: String,
    pub created_at: DateTime<Utc>,
    /// Raw remote content, judged for suitability and sent to the backend.
    pub content: String,
}

pub fn digest_path(sync_root: &Path, key: WeekKey) -> PathBuf {
    sync_root
        .join(key.year.to_string())
        .join("weekly")
        .join(format!("第{:02}周总结.md", key.week))
}

/// Suitable entries bucketed by ISO week, oldest week first.
pub fn group_by_week<'a>(
    entries: &'a [DigestEntry],
    tz: &Tz,
) -> BTreeMap<WeekKey, Vec<&'a DigestEntry>> {
    let mut groups: BTreeMap<WeekKey, Vec<&DigestEntry>> = BTreeMap::new();
    for entry in entries.iter().filter(|e| is_suitable_for_ai(&e.content)) {
        groups
            .entry(WeekKey::of(entry.created_at, tz))
            .or_default()
            .push(entry);
    }
    groups
}

fn date_range(key: WeekKey, language: SummaryLanguage) -> String {
    let (Some(monday), Some(sunday)) = (key.monday(), key.sunday()) else {
        return format!("{}-W{:02}", key.year, key.week);
    };
    if language.is_chinese() {
        format!(
            "{}月{}日 - {}月{}日",
            monday.month(),
            monday.day(),
            sunday.month(),
            sunday.day()
        )
    } else {
        format!("{} - {}", monday.format("%b %-d"), sunday.format("%b %-d"))
    }
}

pub fn render_digest(
    key: WeekKey,
    narrative: &str,
    record_count: usize,
    generated_at: DateTime<Tz>,
    language: SummaryLanguage,
) -> String {
    let range = date_range(key, language);
    let generated = generated_at.format("%Y-%m-%d %H:%M:%S");
    let narrative = narrative.trim();
    if language.is_chinese() {
        format!(
            "# 📅 第 {week:02} 周回顾 ({range})\n\n\
             ## 🌟 本周亮点\n\n{narrative}\n\n\
             ## 📊 统计数据\n\n- 📝 记录数量：{record_count} 条\n- 📅 时间范围：{range}\n\n\
             ## 💪 下周展望\n\n> [!quote] 激励语录\n> 每一个当下都是未来的起点，让我们继续前行，创造更多精彩！\n\n\
             ---\n*生成时间：{generated}*\n",
            week = key.week
        )
    } else {
        format!(
            "# 📅 Week {week:02} Review ({range})\n\n\
             ## 🌟 Highlights\n\n{narrative}\n\n\
             ## 📊 Statistics\n\n- 📝 Records: {record_count}\n- 📅 Range: {range}\n\n\
             ## 💪 Looking Ahead\n\n> [!quote] Motivation\n> Every present moment is the starting point of the future. Keep going!\n\n\
             ---\n*Generated: {generated}*\n",
            week = key.week
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DigestReport {
    pub written: usize,
    pub skipped_existing: usize,
    pub empty: usize,
    pub failed: usize,
}

enum WeekOutcome {
    Written,
    Existing,
    Empty,
}

pub struct DigestAggregator {
    storage: Arc<dyn Storage>,
    ai: Arc<dyn AiBackend>,
    sync_root: PathBuf,
    tz: Tz,
    language: SummaryLanguage,
}

impl DigestAggregator {
    pub fn new(
        storage: Arc<dyn Storage>,
        ai: Arc<dyn AiBackend>,
        sync_root: impl Into<PathBuf>,
        tz: Tz,
        language: SummaryLanguage,
    ) -> Self {
        Self {
            storage,
            ai,
            sync_root: sync_root.into(),
            tz,
            language,
        }
    }

    /// One week's failure is logged and never stops the remaining weeks.
    pub async fn generate_digests(&self, entries: &[DigestEntry]) -> DigestReport {
        let mut report = DigestReport::default();
        for (key, group) in group_by_week(entries, &self.tz) {
            match self.generate_week(key, &group).await {
                Ok(WeekOutcome::Written) => report.written += 1,
                Ok(WeekOutcome::Existing) => report.skipped_existing += 1,
                Ok(WeekOutcome::Empty) => report.empty += 1,
                Err(err) => {
                    error!(year = key.year, week = key.week, error = %format!("{err:#}"), "weekly digest failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn generate_week(
        &self,
        key: WeekKey,
        group: &[&DigestEntry],
    ) -> anyhow::Result<WeekOutcome> {
        let path = digest_path(&self.sync_root, key);
        if self.storage.exists(&path).await? {
            debug!(path = %path.display(), "weekly digest already present");
            return Ok(WeekOutcome::Existing);
        }
        if let Some(dir) = path.parent() {
            self.storage
                .create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }

        let bodies: Vec<String> = group.iter().map(|e| e.content.clone()).collect();
        debug!(
            year = key.year,
            week = key.week,
            records = bodies.len(),
            chars = bodies.join(DIGEST_DIVIDER).chars().count(),
            "requesting weekly digest"
        );
        let narrative = self
            .ai
            .generate_weekly_digest(&bodies, self.language)
            .await
            .context("generating weekly digest")?;
        if narrative.trim().is_empty() {
            warn!(year = key.year, week = key.week, "backend returned an empty digest; nothing written");
            return Ok(WeekOutcome::Empty);
        }

        let generated_at = Utc::now().with_timezone(&self.tz);
        let document = render_digest(key, &narrative, group.len(), generated_at, self.language);
        self.storage
            .create(&path, &document)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), records = group.len(), "weekly digest written");
        Ok(WeekOutcome::Written)
    }
}
