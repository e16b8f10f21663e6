//! Token-budgeted rendering of retrieved summaries

use crate::config::RetrievalSettings;
use crate::embedding::TokenEstimator;
use crate::record::{ConversationMatch, ExchangeMatch};

const CONVERSATION_HEADER: &str = "## Related Conversations\n";

/// Always charged with its leading blank line, even when it opens the context
const EXCHANGE_HEADER: &str = "\n## Relevant Exchanges\n";

/// Rendered context and what went into it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormattedContext {
    pub text: String,
    pub conversations: usize,
    pub exchanges: usize,
    pub tokens: usize,
}

/// Pack ranked matches into at most `settings.token_budget` estimated tokens.
///
/// The budget is split `conversation_budget_pct` / remainder between the two
/// sections. Each section takes items in rank order and stops at the first
/// one that does not fit; a section header is paid for by its first item.
pub fn format_context(
    conversations: &[ConversationMatch],
    exchanges: &[ExchangeMatch],
    settings: &RetrievalSettings,
    estimator: &dyn TokenEstimator,
) -> FormattedContext {
    let budget = settings.token_budget;
    let conversation_allowance =
        ((budget as f64 * settings.conversation_budget_pct as f64).floor() as usize).min(budget);
    let exchange_allowance = budget - conversation_allowance;

    let conversation_lines: Vec<String> = conversations
        .iter()
        .map(|c| format!("- [#{}] {}\n", c.conversation_id, c.summary.trim()))
        .collect();
    let exchange_lines: Vec<String> = exchanges
        .iter()
        .map(|x| format!("- [#{}/{}] {}\n", x.conversation_id, x.exchange_id, x.summary.trim()))
        .collect();

    let mut n_conversations = pack(CONVERSATION_HEADER, &conversation_lines, conversation_allowance, estimator);
    let mut n_exchanges = pack(EXCHANGE_HEADER, &exchange_lines, exchange_allowance, estimator);

    // Section sums bound the whole only for sub-additive estimators; check the
    // real string and shed trailing items if needed
    loop {
        let text = render(&conversation_lines[..n_conversations], &exchange_lines[..n_exchanges]);
        let tokens = estimator.estimate(&text);
        if tokens <= budget || (n_conversations == 0 && n_exchanges == 0) {
            return FormattedContext {
                text,
                conversations: n_conversations,
                exchanges: n_exchanges,
                tokens,
            };
        }
        if n_exchanges > 0 {
            n_exchanges -= 1;
        } else {
            n_conversations -= 1;
        }
    }
}

/// How many leading `lines` fit in `allowance` together with `header`
fn pack(header: &str, lines: &[String], allowance: usize, estimator: &dyn TokenEstimator) -> usize {
    let mut used = estimator.estimate(header);
    let mut count = 0;

    for line in lines {
        let cost = estimator.estimate(line);
        if used + cost > allowance {
            break;
        }
        used += cost;
        count += 1;
    }

    count
}

fn render(conversation_lines: &[String], exchange_lines: &[String]) -> String {
    let mut out = String::new();

    if !conversation_lines.is_empty() {
        out.push_str(CONVERSATION_HEADER);
        for line in conversation_lines {
            out.push_str(line);
        }
    }

    if !exchange_lines.is_empty() {
        if out.is_empty() {
            out.push_str(EXCHANGE_HEADER.trim_start_matches('\n'));
        } else {
            out.push_str(EXCHANGE_HEADER);
        }
        for line in exchange_lines {
            out.push_str(line);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::CharEstimator;
    use chrono::Utc;

    fn conversation(id: i64, summary: &str) -> ConversationMatch {
        ConversationMatch {
            conversation_id: id,
            summary: summary.to_string(),
            similarity: 0.9,
            recency: Utc::now(),
        }
    }

    fn exchange(id: i64, conversation_id: i64, summary: &str) -> ExchangeMatch {
        ExchangeMatch {
            exchange_id: id,
            conversation_id,
            summary: summary.to_string(),
            similarity: 0.8,
            recency: Utc::now(),
        }
    }

    fn settings(budget: usize) -> RetrievalSettings {
        RetrievalSettings {
            token_budget: budget,
            ..Default::default()
        }
    }

    fn sample() -> (Vec<ConversationMatch>, Vec<ExchangeMatch>) {
        let conversations = (1..=4)
            .map(|i| conversation(i, &format!("Conversation {} about tuning query plans and indexes", i)))
            .collect();
        let exchanges = (1..=6)
            .map(|i| exchange(100 + i, 1 + i % 2, &format!("Exchange {} where we added a covering index", i)))
            .collect();
        (conversations, exchanges)
    }

    #[test]
    fn test_everything_fits_in_large_budget() {
        let (c, x) = sample();
        let out = format_context(&c, &x, &settings(10_000), &CharEstimator);
        assert_eq!(out.conversations, 4);
        assert_eq!(out.exchanges, 6);
        assert!(out.text.starts_with(CONVERSATION_HEADER));
        assert!(out.text.contains("\n\n## Relevant Exchanges\n"));
    }

    #[test]
    fn test_never_exceeds_budget() {
        let (c, x) = sample();
        for budget in 1..400 {
            let out = format_context(&c, &x, &settings(budget), &CharEstimator);
            assert!(out.tokens <= budget, "budget {} produced {} tokens", budget, out.tokens);
            assert_eq!(out.tokens, CharEstimator.estimate(&out.text));
        }
    }

    #[test]
    fn test_smaller_budget_never_includes_more() {
        let (c, x) = sample();
        let mut previous = usize::MAX;
        for budget in (1..400).rev() {
            let out = format_context(&c, &x, &settings(budget), &CharEstimator);
            let included = out.conversations + out.exchanges;
            assert!(included <= previous, "budget {} included {} > {}", budget, included, previous);
            previous = included;
        }
    }

    #[test]
    fn test_exchanges_only_has_no_leading_blank_line() {
        let (_, x) = sample();
        let out = format_context(&[], &x, &settings(2000), &CharEstimator);
        assert!(out.text.starts_with("## Relevant Exchanges\n"));
        assert_eq!(out.conversations, 0);
    }

    #[test]
    fn test_packing_stops_at_first_item_that_does_not_fit() {
        let conversations = vec![
            conversation(1, "short"),
            conversation(2, &"long ".repeat(200)),
            conversation(3, "short again"),
        ];
        let out = format_context(&conversations, &[], &settings(100), &CharEstimator);
        assert_eq!(out.conversations, 1);
        assert!(!out.text.contains("short again"));
    }

    #[test]
    fn test_budget_split() {
        // 40 tokens for conversations leaves room for the header and a couple of lines
        let (c, x) = sample();
        let out = format_context(&c, &x, &settings(100), &CharEstimator);
        assert!(out.conversations >= 1 && out.conversations < 4);
        assert!(out.exchanges >= 1);
    }
}
