use storybook_contracts::request::{GenerationRequest, Stanza, Subject};

fn character_line(subject: &Subject) -> Option<String> {
    let name = subject.name.trim();
    let description = subject.description.as_deref().map(str::trim)?;
    if name.is_empty() || description.is_empty() {
        return None;
    }
    let label = match subject.relationship.as_deref().map(str::trim) {
        Some(relationship) if !relationship.is_empty() => format!("{name} ({relationship})"),
        _ => name.to_string(),
    };
    Some(format!("If {label} appears: {description}"))
}

fn characters_block(request: &GenerationRequest) -> String {
    let lines: Vec<String> = request
        .subjects
        .subjects
        .iter()
        .filter_map(character_line)
        .collect();
    if lines.is_empty() {
        return String::new();
    }
    format!(
        "Characters (keep them consistent across the book):\n{}",
        lines.join("\n")
    )
}

fn squeeze_blank_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn stanza_prompt(request: &GenerationRequest, stanza: &Stanza, total: usize) -> String {
    squeeze_blank_lines(&format!(
        "Create a children's storybook illustration.\n\
         Style: {style}.\n\
         {characters}\n\
         This is image {number} of {total}; keep the world and characters consistent with the rest of the book.\n\
         Do not render any text or lettering in the image.\n\
         Stanza:\n{text}",
        style = request.style.description(),
        characters = characters_block(request),
        number = stanza.index + 1,
        text = stanza.text,
    ))
}

pub fn cover_prompt(request: &GenerationRequest, stanzas: &[Stanza]) -> String {
    let opening = stanzas
        .first()
        .map(|stanza| stanza.text.as_str())
        .unwrap_or_default();
    squeeze_blank_lines(&format!(
        "Create the cover illustration for a children's storybook.\n\
         Style: {style}.\n\
         {characters}\n\
         Portrait framing with open space near the top for a title; do not render any text.\n\
         The story opens with:\n{opening}",
        style = request.style.description(),
        characters = characters_block(request),
    ))
}
