use crate::runner::{DEFAULT_MAX_NEW_TOKENS, DEFAULT_TEMPERATURE};

pub const DEFAULT_PROMPT: &str = "Rewrite this to be friendlier but still professional: 'Your payment is overdue.'";

pub const TITLE: &str = "RLHF-mini: Qwen 0.5B + LoRA (DPO) on 41 pairs";
pub const DESCRIPTION: &str = "Tiny LoRA adapter (~18 MB) trained with DPO to improve tone/clarity/safety. Runs on CPU.";

pub const TEMPERATURE_RANGE: (f64, f64, f64) = (0.1, 1.2, 0.05);
pub const MAX_TOKENS_RANGE: (usize, usize, usize) = (32, 512, 8);

/// Values shown in the form.
#[derive(Debug, Clone)]
pub struct PageState {
    pub prompt: String,
    pub temperature: f64,
    pub max_new_tokens: usize,
    pub output: String,
}

impl Default for PageState {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            output: String::new(),
        }
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn render(state: &PageState) -> String {
    let (t_min, t_max, t_step) = TEMPERATURE_RANGE;
    let (n_min, n_max, n_step) = MAX_TOKENS_RANGE;
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{title}</title>
<style>
body {{ font-family: sans-serif; max-width: 48rem; margin: 2rem auto; padding: 0 1rem; }}
textarea {{ width: 100%; box-sizing: border-box; }}
label {{ display: block; margin-top: 1rem; }}
input[type=range] {{ width: 100%; }}
button {{ margin-top: 1rem; padding: 0.5rem 1.5rem; }}
</style>
</head>
<body>
<h1>{title}</h1>
<p>{description}</p>
<form method="post" action="/generate">
<label for="prompt">Prompt</label>
<textarea id="prompt" name="prompt" rows="4">{prompt}</textarea>
<label for="temperature">Temperature: <output id="temperature-value">{temperature}</output></label>
<input type="range" id="temperature" name="temperature" min="{t_min}" max="{t_max}" step="{t_step}" value="{temperature}" oninput="document.getElementById('temperature-value').value = this.value">
<label for="max_new_tokens">Max new tokens: <output id="max-value">{max_new_tokens}</output></label>
<input type="range" id="max_new_tokens" name="max_new_tokens" min="{n_min}" max="{n_max}" step="{n_step}" value="{max_new_tokens}" oninput="document.getElementById('max-value').value = this.value">
<button type="submit">Generate</button>
</form>
<label for="output">Output</label>
<textarea id="output" rows="8" readonly>{output}</textarea>
</body>
</html>
"#,
        title = escape_html(TITLE),
        description = escape_html(DESCRIPTION),
        prompt = escape_html(&state.prompt),
        temperature = state.temperature,
        max_new_tokens = state.max_new_tokens,
        output = escape_html(&state.output),
    )
}
