//! Prompt assembly under a priority-weighted token budget: recent turns
//! first, then filtered memories, matched facts, and the user profile.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::chunker::estimate_tokens;
use crate::config::HmlrConfig;
use crate::db::{iso_from_ms, Fact, Turn};
use crate::prompts;
use crate::retrieval::ScoredMemory;
use crate::util::truncate_chars;

/// Shares of the variable budget, in percent. Turns take the remainder
/// (50% plus any rounding slack).
const MEMORIES_SHARE: usize = 30;
const FACTS_SHARE: usize = 10;
const PROFILE_SHARE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenBudget {
    pub system: usize,
    pub tasks: usize,
    pub bridge_block: usize,
    pub memories: usize,
    pub facts: usize,
    pub profile: usize,
}

impl TokenBudget {
    pub fn total(&self) -> usize {
        self.system + self.tasks + self.bridge_block + self.memories + self.facts + self.profile
    }
}

/// Split `total` into the fixed system/task shares and the four variable
/// buckets (50/30/10/10 of the remainder). The rounding remainder lands
/// in the turns bucket so the shares always sum to `total`.
pub fn allocate_token_budget(total: usize, system: usize, tasks: usize) -> TokenBudget {
    let variable = total.saturating_sub(system + tasks);
    let memories = variable * MEMORIES_SHARE / 100;
    let facts = variable * FACTS_SHARE / 100;
    let profile = variable * PROFILE_SHARE / 100;
    let bridge_block = variable - memories - facts - profile;
    TokenBudget { system, tasks, bridge_block, memories, facts, profile }
}

/// Hand back unused fixed budget to the variable buckets, proportional to
/// their initial shares.
pub fn reallocate_unused(budget: TokenBudget, unused_fixed: usize) -> TokenBudget {
    if unused_fixed == 0 {
        return budget;
    }
    let memories_extra = unused_fixed * MEMORIES_SHARE / 100;
    let facts_extra = unused_fixed * FACTS_SHARE / 100;
    let profile_extra = unused_fixed * PROFILE_SHARE / 100;
    let turns_extra = unused_fixed - memories_extra - facts_extra - profile_extra;
    TokenBudget {
        bridge_block: budget.bridge_block + turns_extra,
        memories: budget.memories + memories_extra,
        facts: budget.facts + facts_extra,
        profile: budget.profile + profile_extra,
        ..budget
    }
}

/// Which metadata instruction variant to append for this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMode {
    NewTopic,
    Continuation,
}

pub struct HydratorInput<'a> {
    pub query: &'a str,
    pub system_prompt: &'a str,
    pub turns: &'a [Turn],
    pub memories: &'a [ScoredMemory],
    pub facts: &'a [Fact],
    pub profile: Option<&'a str>,
    pub metadata_mode: MetadataMode,
}

#[derive(Debug, Serialize)]
pub struct HydratedPrompt {
    pub system: String,
    pub user: String,
    pub budget: TokenBudget,
    pub turns_used: usize,
    pub memories_used: usize,
    pub facts_used: usize,
    pub total_tokens: usize,
}

/// Greedy fill of the turns bucket: newest first while the budget holds,
/// rendered chronologically.
fn build_turns_section(turns: &[Turn], budget: usize) -> (String, usize) {
    let mut sorted: Vec<&Turn> = turns.iter().collect();
    sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));

    let mut taken: Vec<String> = Vec::new();
    let mut used_tokens = 0usize;
    for t in sorted {
        let formatted = format!(
            "[{}]\nUser: {}\nAssistant: {}",
            iso_from_ms(t.timestamp),
            t.user_message,
            t.ai_response
        );
        let tokens = estimate_tokens(&formatted);
        if used_tokens + tokens > budget {
            break;
        }
        used_tokens += tokens;
        taken.push(formatted);
    }
    if taken.is_empty() {
        return (String::new(), 0);
    }
    taken.reverse();
    (format!("=== Recent Conversation ===\n{}", taken.join("\n\n")), taken.len())
}

fn build_memories_section(memories: &[ScoredMemory], budget: usize) -> (String, usize) {
    let mut sorted: Vec<&ScoredMemory> = memories.iter().collect();
    sorted.sort_by(|a, b| {
        b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut taken: Vec<String> = Vec::new();
    let mut used_tokens = 0usize;
    for (i, m) in sorted.into_iter().enumerate() {
        let formatted = format!(
            "[Memory {}] (relevance: {:.0}%)\n{}",
            i + 1,
            m.score * 100.0,
            m.memory.content
        );
        let tokens = estimate_tokens(&formatted);
        if used_tokens + tokens > budget {
            break;
        }
        used_tokens += tokens;
        taken.push(formatted);
    }
    if taken.is_empty() {
        return (String::new(), 0);
    }
    (format!("=== Relevant History ===\n{}", taken.join("\n\n")), taken.len())
}

fn build_facts_section(facts: &[Fact], budget: usize) -> (String, usize) {
    let mut taken: Vec<String> = Vec::new();
    let mut used_tokens = 0usize;
    for f in facts {
        let category = f.category.map(|c| c.as_str()).unwrap_or("general");
        let formatted = format!("{}[{}]: {}", f.key, category, f.value);
        let tokens = estimate_tokens(&formatted);
        if used_tokens + tokens > budget {
            break;
        }
        used_tokens += tokens;
        taken.push(formatted);
    }
    if taken.is_empty() {
        return (String::new(), 0);
    }
    (format!("=== Known Facts ===\n{}", taken.join("\n")), taken.len())
}

fn build_profile_section(profile: Option<&str>, budget: usize) -> String {
    let Some(profile) = profile.filter(|p| !p.trim().is_empty()) else {
        return String::new();
    };
    // Token budget to characters, 4:1.
    let truncated = truncate_chars(profile.trim(), budget * 4);
    format!("=== User Profile ===\n{truncated}")
}

/// Assemble the full prompt under the configured budget. Unused fixed
/// budget (short system prompt, short instructions) flows back into the
/// variable buckets before the sections fill.
pub fn hydrate(cfg: &HmlrConfig, input: &HydratorInput) -> HydratedPrompt {
    let instructions = match input.metadata_mode {
        MetadataMode::NewTopic => prompts::METADATA_INSTRUCTIONS_NEW_TOPIC,
        MetadataMode::Continuation => prompts::METADATA_INSTRUCTIONS_CONTINUATION,
    };

    let budget =
        allocate_token_budget(cfg.max_context_tokens, cfg.system_tokens, cfg.task_tokens);
    let system_used = estimate_tokens(input.system_prompt).min(budget.system);
    let tasks_used = estimate_tokens(instructions).min(budget.tasks);
    let unused_fixed = (budget.system - system_used) + (budget.tasks - tasks_used);
    let budget = reallocate_unused(budget, unused_fixed);

    let profile_budget = budget.profile.min(cfg.profile_max_tokens);
    let (turns_section, turns_used) = build_turns_section(input.turns, budget.bridge_block);
    let (memories_section, memories_used) =
        build_memories_section(input.memories, budget.memories);
    let (facts_section, facts_used) = build_facts_section(input.facts, budget.facts);
    let profile_section = build_profile_section(input.profile, profile_budget);

    let mut sections: Vec<&str> = Vec::new();
    for s in [
        profile_section.as_str(),
        facts_section.as_str(),
        memories_section.as_str(),
        turns_section.as_str(),
    ] {
        if !s.is_empty() {
            sections.push(s);
        }
    }
    let context = sections.join("\n\n");
    let user = if context.is_empty() {
        format!("{}\n{instructions}", input.query)
    } else {
        format!("{context}\n\n{}\n{instructions}", input.query)
    };

    let total_tokens = system_used + estimate_tokens(&user);

    HydratedPrompt {
        system: input.system_prompt.to_string(),
        user,
        budget,
        turns_used,
        memories_used,
        facts_used,
        total_tokens,
    }
}

// ---------------------------------------------------------------------------
// Response metadata extraction
// ---------------------------------------------------------------------------

/// Block metadata the model appends to its response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseMetadata {
    #[serde(default)]
    pub topic_label: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub open_loops: Vec<String>,
    #[serde(default)]
    pub decisions_made: Vec<String>,
    #[serde(default)]
    pub affect: Option<String>,
}

fn fenced_json_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").expect("fenced json pattern"))
}

/// Outermost `{…}` by brace depth. Tolerates nested fences inside the
/// JSON body, which the fenced regex would truncate on.
fn outermost_braces(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split an LLM response into visible text and embedded block metadata.
/// The fenced block is removed from the returned text.
pub fn extract_response_metadata(response: &str) -> (String, Option<ResponseMetadata>) {
    if let Some(caps) = fenced_json_pattern().captures(response) {
        let raw = caps.get(1).expect("group").as_str();
        if let Ok(meta) = serde_json::from_str::<ResponseMetadata>(raw) {
            let whole = caps.get(0).expect("match");
            let mut clean = String::with_capacity(response.len());
            clean.push_str(&response[..whole.start()]);
            clean.push_str(&response[whole.end()..]);
            return (clean.trim().to_string(), Some(meta));
        }
        // Fence found but its body truncated badly — retry from the fence
        // start with the brace scanner.
        if let Some(raw) = outermost_braces(&response[caps.get(0).expect("match").start()..]) {
            if let Ok(meta) = serde_json::from_str::<ResponseMetadata>(raw) {
                let start = caps.get(0).expect("match").start();
                return (response[..start].trim().to_string(), Some(meta));
            }
        }
    }
    (response.trim().to_string(), None)
}
