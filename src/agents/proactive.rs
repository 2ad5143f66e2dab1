//! Proactive prompt policy
//!
//! High severity picks a category-specific check-in for the first
//! high-severity insight, medium gets a gentle generic one, low gets nothing.

use super::wellness::{Severity, WellnessCategory, WellnessInsight};

pub const GENTLE_CHECK_IN: &str = "Hey, just checking in. What's been on your mind lately?";

fn high_severity_prompt(category: WellnessCategory) -> &'static str {
    match category {
        WellnessCategory::Mood => {
            "I've noticed some patterns in our conversations lately. How have you been feeling about things?"
        }
        WellnessCategory::Behavioral => {
            "I wanted to check in - I've noticed some changes. How are you taking care of yourself these days?"
        }
        WellnessCategory::Cognitive => {
            "Can I ask you something? I'm curious about how you've been processing things lately."
        }
        WellnessCategory::Emotional => {
            "I've been thinking about our conversations. How would you describe your emotional energy right now?"
        }
        WellnessCategory::Social => {
            "I wanted to reach out - how have your connections with others been feeling lately?"
        }
    }
}

pub fn select_prompt(insights: &[WellnessInsight]) -> Option<&'static str> {
    if let Some(high) = insights.iter().find(|i| i.severity == Severity::High) {
        return Some(high_severity_prompt(high.category));
    }
    insights
        .iter()
        .any(|i| i.severity == Severity::Medium)
        .then_some(GENTLE_CHECK_IN)
}
