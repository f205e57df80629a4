//! Token 预算控制
//!
//! 发送前估算请求 token 数；超出上限时依次执行：冗余去除 → 大块摘要 → 按段优先级截断，
//! 一旦满足预算立即停止。截断顺序为 data → examples → output_format → instructions，
//! 因此指令与输出格式段总是最后被动到。

use std::cmp::Reverse;
use std::collections::HashSet;

use serde::Serialize;

use super::{Message, PromptSection, Role};

/// 每条消息的固定开销（角色、分隔符）
pub const MESSAGE_OVERHEAD: usize = 4;

const TRUNCATION_MARKER: &str = "\n[truncated due to token budget]";

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let (ascii, non_ascii) = char_counts(text);
        token_count(ascii, non_ascii)
    }

    pub fn estimate_message(message: &Message) -> usize {
        Self::estimate(&message.content) + MESSAGE_OVERHEAD
    }

    pub fn estimate_messages(messages: &[Message]) -> usize {
        messages.iter().map(Self::estimate_message).sum()
    }
}

fn char_counts(text: &str) -> (usize, usize) {
    text.chars().fold((0, 0), |(a, n), c| {
        if c.is_ascii() {
            (a + 1, n)
        } else {
            (a, n + 1)
        }
    })
}

fn token_count(ascii: usize, non_ascii: usize) -> usize {
    (ascii / 4 + (non_ascii as f64 / 1.5).ceil() as usize).max(1)
}

/// 最长前缀（字节下标），使 前缀 + 附加文本 的估算不超过 limit
fn prefix_within(text: &str, limit: usize, extra: (usize, usize)) -> usize {
    let (mut a, mut n) = extra;
    let mut cut = 0;
    for (idx, c) in text.char_indices() {
        if c.is_ascii() {
            a += 1;
        } else {
            n += 1;
        }
        if token_count(a, n) > limit {
            break;
        }
        cut = idx + c.len_utf8();
    }
    cut
}

/// 最长后缀的起始字节下标
fn suffix_within(text: &str, limit: usize) -> usize {
    let (mut a, mut n) = (0, 0);
    let mut start = text.len();
    for (idx, c) in text.char_indices().rev() {
        if c.is_ascii() {
            a += 1;
        } else {
            n += 1;
        }
        if token_count(a, n) > limit {
            break;
        }
        start = idx;
    }
    start
}

/// 截断到 max_tokens 以内（含截断标记）；连标记都放不下时返回 None
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> Option<String> {
    if TokenEstimator::estimate(text) <= max_tokens {
        return Some(text.to_string());
    }
    let marker = char_counts(TRUNCATION_MARKER);
    if token_count(marker.0, marker.1) > max_tokens {
        return None;
    }
    let cut = prefix_within(text, max_tokens, marker);
    Some(format!("{}{}", text[..cut].trim_end(), TRUNCATION_MARKER))
}

/// 抽取式摘要：保留开头与结尾，中间替换为省略说明
fn summarize_block(text: &str, keep_tokens: usize) -> Option<String> {
    let original = TokenEstimator::estimate(text);
    if original <= keep_tokens {
        return None;
    }
    let head_end = prefix_within(text, keep_tokens * 2 / 3, (0, 0));
    let tail_start = suffix_within(text, keep_tokens / 3).max(head_end);
    let omitted = text[head_end..tail_start].chars().count();
    if omitted == 0 {
        return None;
    }
    let summary = format!(
        "{}\n[... {} chars summarized ...]\n{}",
        text[..head_end].trim_end(),
        omitted,
        text[tail_start..].trim_start()
    );
    (TokenEstimator::estimate(&summary) < original).then_some(summary)
}

/// 去除完全重复的消息；data / examples 段内去除重复行与连续空行
fn remove_redundancy(messages: Vec<Message>) -> Vec<Message> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(messages.len());
    for mut message in messages {
        let structural = message.role == Role::Tool || !message.tool_calls.is_empty();
        if !structural && !seen.insert((message.role, message.content.clone())) {
            continue;
        }
        let dedupe_lines = matches!(
            message.effective_section(),
            PromptSection::Data | PromptSection::Examples
        );
        message.content = compact_lines(&message.content, dedupe_lines);
        out.push(message);
    }
    out
}

fn compact_lines(text: &str, dedupe: bool) -> String {
    let mut seen = HashSet::new();
    let mut lines = Vec::new();
    let mut last_blank = false;
    for line in text.lines().map(str::trim_end) {
        if line.is_empty() {
            if !last_blank && !lines.is_empty() {
                lines.push(line);
            }
            last_blank = true;
            continue;
        }
        last_blank = false;
        if dedupe && !seen.insert(line) {
            continue;
        }
        lines.push(line);
    }
    lines.join("\n").trim_end().to_string()
}

/// 裁剪步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStep {
    RedundancyRemoved,
    Summarized,
    Truncated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetReport {
    pub original_tokens: usize,
    pub final_tokens: usize,
    pub steps: Vec<BudgetStep>,
}

impl BudgetReport {
    pub fn trimmed(&self) -> bool {
        !self.steps.is_empty()
    }
}

/// Token 预算优化器
#[derive(Debug, Clone)]
pub struct TokenBudgetOptimizer {
    max_tokens: usize,
    /// 大块摘要后保留的 token 数
    summary_keep_tokens: usize,
}

impl TokenBudgetOptimizer {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            summary_keep_tokens: (max_tokens / 4).max(32),
        }
    }

    pub fn with_summary_keep_tokens(mut self, tokens: usize) -> Self {
        self.summary_keep_tokens = tokens.max(8);
        self
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// 保证返回消息的估算总数不超过 max_tokens
    pub fn fit(&self, messages: Vec<Message>) -> (Vec<Message>, BudgetReport) {
        let original = TokenEstimator::estimate_messages(&messages);
        let mut report = BudgetReport {
            original_tokens: original,
            final_tokens: original,
            steps: Vec::new(),
        };
        if original <= self.max_tokens {
            return (messages, report);
        }

        let mut messages = remove_redundancy(messages);
        report.steps.push(BudgetStep::RedundancyRemoved);
        if self.fits(&messages) {
            report.final_tokens = TokenEstimator::estimate_messages(&messages);
            return (messages, report);
        }

        // 大块 data / examples 先摘要，data 优先、大的优先
        let mut candidates: Vec<usize> = (0..messages.len())
            .filter(|&i| {
                matches!(
                    messages[i].effective_section(),
                    PromptSection::Data | PromptSection::Examples
                )
            })
            .collect();
        candidates.sort_by_key(|&i| {
            (
                Reverse(messages[i].effective_section().priority()),
                Reverse(TokenEstimator::estimate(&messages[i].content)),
            )
        });
        let mut summarized = false;
        for i in candidates {
            if let Some(summary) = summarize_block(&messages[i].content, self.summary_keep_tokens) {
                messages[i].content = summary;
                summarized = true;
                if self.fits(&messages) {
                    break;
                }
            }
        }
        if summarized {
            report.steps.push(BudgetStep::Summarized);
        }
        if self.fits(&messages) {
            report.final_tokens = TokenEstimator::estimate_messages(&messages);
            return (messages, report);
        }

        let messages = self.truncate_by_priority(messages);
        report.steps.push(BudgetStep::Truncated);
        report.final_tokens = TokenEstimator::estimate_messages(&messages);
        (messages, report)
    }

    fn fits(&self, messages: &[Message]) -> bool {
        TokenEstimator::estimate_messages(messages) <= self.max_tokens
    }

    /// 同一段内从后往前截断；放不下截断标记的消息整条移除
    fn truncate_by_priority(&self, messages: Vec<Message>) -> Vec<Message> {
        let mut slots: Vec<Option<Message>> = messages.into_iter().map(Some).collect();
        'sections: for section in PromptSection::truncation_order() {
            let indices: Vec<usize> = slots
                .iter()
                .enumerate()
                .rev()
                .filter(|(_, m)| m.as_ref().is_some_and(|m| m.effective_section() == section))
                .map(|(i, _)| i)
                .collect();
            for i in indices {
                let total: usize = slots
                    .iter()
                    .flatten()
                    .map(TokenEstimator::estimate_message)
                    .sum();
                if total <= self.max_tokens {
                    break 'sections;
                }
                let excess = total - self.max_tokens;
                let truncated = slots[i].as_ref().and_then(|m| {
                    let target = TokenEstimator::estimate(&m.content).checked_sub(excess)?;
                    truncate_to_tokens(&m.content, target)
                });
                match truncated {
                    Some(content) => {
                        if let Some(m) = slots[i].as_mut() {
                            m.content = content;
                        }
                    }
                    None => slots[i] = None,
                }
            }
        }
        slots.into_iter().flatten().collect()
    }
}
