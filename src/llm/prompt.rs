//! System prompt construction.
//!
//! Composed once per call from the companion persona plus the memory
//! store's key listing, so the model knows what it can `recall` without
//! flooding the context with record contents.

use crate::memory::MemoryKeys;

/// Hard bound on the composed prompt length in characters.
const MAX_PROMPT_CHARS: usize = 6_000;

/// Cap on keys listed per group before truncation.
const MAX_KEYS_PER_GROUP: usize = 60;

/// Base companion persona.
///
/// The bullet instruction matters: the delimiter is what carves the reply
/// into individually synthesized segments.
pub const PERSONA: &str = "\
You are Wren, a warm, patient phone companion for an elderly person living \
with dementia. Speak slowly and simply, one thought at a time. Never argue, \
never correct harshly, and never mention that the caller has memory \
problems. Redirect gently when the caller is distressed.

Separate each short spoken phrase with the \u{2022} character. Keep phrases \
under twenty words so they sound natural when spoken aloud.

Use the remember function when the caller shares something worth keeping. \
Use recall to check details before asserting them. If the caller is in \
danger or asks for family, use transfer_call.";

/// Compose the per-call system prompt.
///
/// Facts are presented as trusted, caregiver-entered information; memories
/// as things the companion noticed in earlier calls. The result is bounded
/// to [`MAX_PROMPT_CHARS`].
pub fn build_system_prompt(persona: &str, keys: &MemoryKeys) -> String {
    let mut prompt = String::with_capacity(persona.len() + 512);
    prompt.push_str(persona);

    if !keys.facts.is_empty() {
        prompt.push_str("\n\nTrusted facts about the caller (keys you can recall):\n");
        push_key_list(&mut prompt, &keys.facts);
    }
    if !keys.memories.is_empty() {
        prompt.push_str("\n\nThings you noticed in earlier calls (keys you can recall):\n");
        push_key_list(&mut prompt, &keys.memories);
    }

    if prompt.len() > MAX_PROMPT_CHARS {
        prompt.truncate(MAX_PROMPT_CHARS);
    }
    prompt
}

fn push_key_list(prompt: &mut String, keys: &[String]) {
    for key in keys.iter().take(MAX_KEYS_PER_GROUP) {
        prompt.push_str("- ");
        prompt.push_str(key);
        prompt.push('\n');
    }
    if keys.len() > MAX_KEYS_PER_GROUP {
        prompt.push_str(&format!("(and {} more)\n", keys.len() - MAX_KEYS_PER_GROUP));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_includes_both_key_groups() {
        let keys = MemoryKeys {
            facts: vec!["daughter-name-sarah".to_owned()],
            memories: vec!["likes-gardening".to_owned()],
        };
        let prompt = build_system_prompt(PERSONA, &keys);
        assert!(prompt.contains("daughter-name-sarah"));
        assert!(prompt.contains("likes-gardening"));
        assert!(prompt.contains("Trusted facts"));
    }

    #[test]
    fn empty_store_yields_persona_only() {
        let prompt = build_system_prompt(PERSONA, &MemoryKeys::default());
        assert_eq!(prompt, PERSONA);
    }

    #[test]
    fn prompt_length_is_bounded() {
        let keys = MemoryKeys {
            facts: (0..500).map(|i| format!("fact-key-number-{i}")).collect(),
            memories: (0..500).map(|i| format!("memory-key-number-{i}")).collect(),
        };
        let prompt = build_system_prompt(PERSONA, &keys);
        assert!(prompt.len() <= MAX_PROMPT_CHARS);
        assert!(prompt.contains("(and "));
    }
}
