//! Outbound MIME construction: text/HTML bodies, a display-name From
//! header, and reply threading headers, built with `mail-builder`.

use mail_builder::MessageBuilder;

pub struct OutboundParts<'a> {
    pub from_addr: &'a str,
    pub from_name: Option<&'a str>,
    pub to_addr: &'a str,
    pub subject: &'a str,
    pub text: Option<&'a str>,
    pub html: Option<&'a str>,
    pub in_reply_to: Option<&'a str>,
    pub references: Option<&'a str>,
}

/// Builds an RFC 5322 message, multipart/alternative when both a text and
/// an HTML body are present. Returns the serialized bytes plus the
/// generated `Message-ID` header value, used as a fallback server id when
/// the submission protocol's own response carries none (spec §6).
pub fn build_message(parts: &OutboundParts<'_>) -> anyhow::Result<(Vec<u8>, String)> {
    let message_id = format!("<{}@mailkeep>", uuid::Uuid::new_v4());

    let from = match parts.from_name {
        Some(name) => mail_builder::headers::address::Address::new_address(
            Some(name.to_string()),
            parts.from_addr.to_string(),
        ),
        None => mail_builder::headers::address::Address::new_address(
            None,
            parts.from_addr.to_string(),
        ),
    };

    let mut builder = MessageBuilder::new()
        .from(from)
        .to(parts.to_addr)
        .subject(parts.subject)
        .message_id(message_id.clone());

    if let Some(in_reply_to) = parts.in_reply_to {
        builder = builder.in_reply_to(vec![in_reply_to.to_string()]);
    }
    if let Some(references) = parts.references {
        builder = builder.references(vec![references.to_string()]);
    }

    builder = match (parts.text, parts.html) {
        (Some(text), Some(html)) => builder.text_body(text.to_string()).html_body(html.to_string()),
        (Some(text), None) => builder.text_body(text.to_string()),
        (None, Some(html)) => builder.html_body(html.to_string()),
        (None, None) => builder.text_body(String::new()),
    };

    let bytes = builder
        .write_to_vec()
        .map_err(|_| anyhow::anyhow!("failed to serialize MIME message"))?;

    Ok((bytes, message_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_multipart_alternative_when_both_bodies_present() {
        let parts = OutboundParts {
            from_addr: "agent@example.com",
            from_name: Some("Mailkeep"),
            to_addr: "customer@example.com",
            subject: "Hello",
            text: Some("plain body"),
            html: Some("<p>html body</p>"),
            in_reply_to: None,
            references: None,
        };
        let (bytes, message_id) = build_message(&parts).unwrap();
        let rendered = String::from_utf8_lossy(&bytes);
        assert!(rendered.contains("multipart/alternative"));
        assert!(rendered.contains("plain body"));
        assert!(rendered.contains("html body"));
        assert!(message_id.starts_with('<') && message_id.ends_with('>'));
    }

    #[test]
    fn sets_reply_headers_when_provided() {
        let parts = OutboundParts {
            from_addr: "agent@example.com",
            from_name: None,
            to_addr: "customer@example.com",
            subject: "Re: Hello",
            text: Some("a reply"),
            html: None,
            in_reply_to: Some("<abc@origin>"),
            references: Some("<abc@origin>"),
        };
        let (bytes, _) = build_message(&parts).unwrap();
        let rendered = String::from_utf8_lossy(&bytes);
        assert!(rendered.contains("In-Reply-To: <abc@origin>"));
        assert!(rendered.contains("References: <abc@origin>"));
        assert!(!rendered.contains("multipart/alternative"));
    }
}
