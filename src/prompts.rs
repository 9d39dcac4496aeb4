//! Centralised prompt texts and tool-call JSON schemas.
//!
//! Every LLM prompt and structured-output schema lives here so they can be
//! audited, tuned, and versioned in one place.  The rest of the codebase
//! imports from `crate::prompts`.

// ---------------------------------------------------------------------------
// governor.rs — block routing
// ---------------------------------------------------------------------------

pub const ROUTER_SYSTEM: &str = "You route an incoming chat message to the day's topic ledger. \
    Each listed block is a topic container with its label, status, summary, keywords and turn count. \
    Decide whether the message continues one of the listed blocks or opens a new topic. \
    Prefer the LAST-ACTIVE block for ambiguous follow-ups. \
    Only declare a new topic when the message clearly does not belong to any listed block.";

pub fn router_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "matched_block_id": {
                "type": ["string", "null"],
                "description": "Id of the block the message continues, or null"
            },
            "is_new_topic": {"type": "boolean"},
            "reasoning": {"type": "string", "description": "One short sentence"},
            "suggested_label": {
                "type": ["string", "null"],
                "description": "Topic label when is_new_topic is true"
            }
        },
        "required": ["is_new_topic"]
    })
}

// ---------------------------------------------------------------------------
// governor.rs — 2-key memory filter
// ---------------------------------------------------------------------------

pub const MEMORY_FILTER_SYSTEM: &str = "You filter semantically retrieved memories for actual relevance \
    to the user's query. Vector search surfaces near matches that can mean the opposite of what was \
    asked ('I love X' vs 'I hate X') or share vocabulary without sharing intent. \
    Return the indices of memories that genuinely help answer the query. An empty list is a valid answer.";

pub fn memory_filter_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "relevant_indices": {
                "type": "array",
                "items": {"type": "integer"},
                "description": "Zero-based indices of relevant memories"
            },
            "reasoning": {"type": "string"}
        },
        "required": ["relevant_indices"]
    })
}

// ---------------------------------------------------------------------------
// scribe.rs — block synthesis
// ---------------------------------------------------------------------------

pub const BLOCK_SYNTHESIS_SYSTEM: &str = "Summarise a conversation topic block. Given the turns of one \
    topic-coherent conversation segment, produce its metadata: a short topic label, a 2-3 sentence \
    summary, the user's overall affect, open loops (unresolved questions or promised follow-ups), \
    decisions made, and up to 10 keywords. Be concrete; quote nothing verbatim.";

pub fn block_synthesis_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "topic_label": {"type": "string"},
            "summary": {"type": "string"},
            "user_affect": {
                "type": "string",
                "description": "One of: neutral, curious, frustrated, excited, confused, satisfied, impatient, engaged, bored, enthusiastic, positive, negative"
            },
            "open_loops": {"type": "array", "items": {"type": "string"}},
            "decisions_made": {"type": "array", "items": {"type": "string"}},
            "keywords": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["topic_label", "summary"]
    })
}

// ---------------------------------------------------------------------------
// chat.rs — fact extraction
// ---------------------------------------------------------------------------

pub const FACT_EXTRACT_SYSTEM: &str = r#"You extract durable keyed facts from a chat message. A fact is a
stable assertion worth recalling weeks later: names, deadlines, preferences, decisions, credentials
(never secret values — note their existence only), contacts, dates.

Rules:
- keys are short snake_case identifiers scoped by subject (e.g. project_alpha_deadline, user_editor)
- 0-5 facts per message; zero is the right answer for small talk
- value is the current assertion; restating a known fact with a new value is how updates happen
- evidence is the shortest quote that supports the fact
- category is one of: credential, preference, policy, decision, contact, date, general
- confidence reflects how directly the user stated it (1.0 = verbatim claim)

Skip: opinions about the assistant, transient states, anything already implied by the conversation
mechanics rather than stated by the user."#;

pub fn fact_extract_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "facts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "key": {"type": "string"},
                        "value": {"type": "string"},
                        "category": {
                            "type": "string",
                            "enum": ["credential", "preference", "policy", "decision", "contact", "date", "general"]
                        },
                        "evidence_snippet": {"type": "string"},
                        "confidence": {"type": "number"}
                    },
                    "required": ["key", "value"]
                }
            }
        },
        "required": ["facts"]
    })
}

// ---------------------------------------------------------------------------
// hydrator.rs — response metadata instructions
// ---------------------------------------------------------------------------

pub const METADATA_INSTRUCTIONS_NEW_TOPIC: &str = r#"
After your response, append a fenced json block describing this new conversation topic:

```json
{"topic_label": "...", "keywords": ["..."], "summary": "...", "open_loops": ["..."], "decisions_made": ["..."], "affect": "..."}
```

affect is one of: neutral, curious, frustrated, excited, confused, satisfied, impatient, engaged, bored, enthusiastic, positive, negative."#;

pub const METADATA_INSTRUCTIONS_CONTINUATION: &str = r#"
After your response, append a fenced json block with only the fields that changed this turn
(new keywords, new open loops, resolved loops removed, decisions made, current affect):

```json
{"keywords": ["..."], "open_loops": ["..."], "decisions_made": ["..."], "affect": "..."}
```"#;

// ---------------------------------------------------------------------------
// scribe.rs — day / week / profile synthesis
// ---------------------------------------------------------------------------

pub const DAY_SYNTHESIS_SYSTEM: &str = "Write a daily digest of the user's conversations. Given the \
    day's topic blocks with summaries and decisions, produce one paragraph covering what was worked \
    on, what was decided, and what remains open. Plain prose, no headings.";

pub const WEEK_SYNTHESIS_SYSTEM: &str = "Write a weekly digest from seven daily digests. Surface the \
    recurring themes, the week's decisions, and the threads still open. One or two paragraphs.";

pub const PROFILE_SCRIBE_SYSTEM: &str = "Maintain a compact user profile from conversation evidence. \
    Given the current profile, recent facts, and recent topic summaries, rewrite the profile: who the \
    user is, preferences, active projects, constraints. One paragraph, under 200 words. Keep stable \
    traits, drop stale ones, fold in the new evidence.";
