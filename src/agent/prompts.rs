//! Classifier prompt templates (spec §4.4 step 4). The user prompt is
//! assembled conditionally on which optional contexts (thread, semantic)
//! are non-empty.

pub fn system_prompt(display_name: Option<&str>) -> String {
    let sender = display_name.unwrap_or("the account holder");
    format!(
        r#"You are an email triage agent acting on behalf of {sender}. Your job is to classify incoming emails and, where appropriate, draft a reply.

CLASSIFICATION RULES:
1. "auto_reply" (confidence >= 0.85): you are certain of the answer and it requires no judgment call.
2. "draft_for_review" (confidence 0.50-0.84): you can compose a helpful reply but aren't fully confident, or the topic is sensitive (pricing, legal, scheduling specifics).
3. "escalate" (confidence < 0.50): the email requires human judgment you cannot supply.
4. "ignore": spam, newsletters, automated notifications, marketing, bounces, out-of-office replies.

SAFETY RULES:
- Never provide legal, tax, or immigration advice; suggest consulting a professional.
- Never commit to pricing, timelines, or availability you are not given evidence for.
- When in doubt: draft_for_review over auto_reply, escalate over draft_for_review.
- If the email replies to a thread you lack context for, escalate.

REPLY STYLE: plain text, no markdown formatting, concise, and warm without being informal.

RESPONSE FORMAT: respond with a single JSON object and nothing else:
{{
    "classification": "auto_reply" | "draft_for_review" | "escalate" | "ignore",
    "confidence": 0.0 to 1.0,
    "reasoning": "brief explanation",
    "draft_reply": "full reply text, or null",
    "escalation_note": "what a human needs to decide, or null",
    "signals": {{ "kb_match": true|false, "sensitive_categories": [], "thread_context": true|false }}
}}"#
    )
}

pub struct PromptArgs<'a> {
    pub from_addr: &'a str,
    pub subject: &'a str,
    pub date: &'a str,
    pub body: &'a str,
    pub thread_context: &'a str,
    pub semantic_context: &'a str,
}

/// Selects among the four template variants by which contexts are present.
pub fn user_prompt(args: &PromptArgs<'_>) -> String {
    let header = format!(
        "From: {}\nSubject: {}\nDate: {}\n\n{}",
        args.from_addr, args.subject, args.date, args.body
    );

    let thread_block = if args.thread_context.is_empty() {
        String::new()
    } else {
        format!("\n\n--- THREAD HISTORY ---\n{}\n--- END THREAD HISTORY ---", args.thread_context)
    };

    let semantic_block = if args.semantic_context.is_empty() {
        String::new()
    } else {
        format!(
            "\n\n--- RELEVANT PRIOR CONVERSATIONS ---\n{}\n--- END RELEVANT PRIOR CONVERSATIONS ---",
            args.semantic_context
        )
    };

    format!("{header}{thread_block}{semantic_block}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_prompt_omits_context_blocks_when_empty() {
        let args = PromptArgs {
            from_addr: "a@example.com",
            subject: "Hi",
            date: "today",
            body: "body text",
            thread_context: "",
            semantic_context: "",
        };
        let prompt = user_prompt(&args);
        assert!(!prompt.contains("THREAD HISTORY"));
        assert!(!prompt.contains("RELEVANT PRIOR CONVERSATIONS"));
    }

    #[test]
    fn user_prompt_includes_both_contexts_when_present() {
        let args = PromptArgs {
            from_addr: "a@example.com",
            subject: "Hi",
            date: "today",
            body: "body text",
            thread_context: "earlier message",
            semantic_context: "similar past message",
        };
        let prompt = user_prompt(&args);
        assert!(prompt.contains("THREAD HISTORY"));
        assert!(prompt.contains("earlier message"));
        assert!(prompt.contains("RELEVANT PRIOR CONVERSATIONS"));
        assert!(prompt.contains("similar past message"));
    }
}
