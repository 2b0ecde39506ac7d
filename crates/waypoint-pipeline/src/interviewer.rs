//! Interviewer contract and built-in implementations for human gates.

use async_trait::async_trait;
use waypoint_types::Result;

#[derive(Debug, Clone)]
pub struct Question {
    pub prompt: String,
    pub options: Vec<String>,
}

#[async_trait]
pub trait Interviewer: Send + Sync {
    /// Ask a question and return the chosen option (or free-form text).
    async fn ask(&self, question: &Question) -> Result<String>;
}

// ---------------------------------------------------------------------------
// AutoApproveInterviewer
// ---------------------------------------------------------------------------

/// Always picks the first option. Useful for unattended runs.
pub struct AutoApproveInterviewer;

#[async_trait]
impl Interviewer for AutoApproveInterviewer {
    async fn ask(&self, question: &Question) -> Result<String> {
        Ok(question.options.first().cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// ConsoleInterviewer
// ---------------------------------------------------------------------------

/// Prompts on stdout and reads a line from stdin. A numeric answer picks
/// the corresponding option; anything else is returned verbatim.
pub struct ConsoleInterviewer;

#[async_trait]
impl Interviewer for ConsoleInterviewer {
    async fn ask(&self, question: &Question) -> Result<String> {
        println!("\n{}", question.prompt);
        for (i, option) in question.options.iter().enumerate() {
            println!("  [{}] {}", i + 1, option);
        }
        let mut input = String::new();
        std::io::stdin()
            .read_line(&mut input)
            .map_err(waypoint_types::WaypointError::Io)?;
        let trimmed = input.trim();
        if let Ok(idx) = trimmed.parse::<usize>() {
            if idx > 0 && idx <= question.options.len() {
                return Ok(question.options[idx - 1].clone());
            }
        }
        Ok(trimmed.to_string())
    }
}

// ---------------------------------------------------------------------------
// RecordingInterviewer
// ---------------------------------------------------------------------------

/// Plays back preset answers and records every question asked. The test
/// harness for human gates.
pub struct RecordingInterviewer {
    answers: std::sync::Mutex<Vec<String>>,
    questions: std::sync::Mutex<Vec<Question>>,
}

impl RecordingInterviewer {
    pub fn new(answers: Vec<String>) -> Self {
        let mut reversed = answers;
        reversed.reverse();
        Self {
            answers: std::sync::Mutex::new(reversed),
            questions: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// The questions asked so far.
    pub fn questions(&self) -> Vec<Question> {
        self.questions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Interviewer for RecordingInterviewer {
    async fn ask(&self, question: &Question) -> Result<String> {
        self.questions.lock().unwrap().push(question.clone());
        let answer = self.answers.lock().unwrap().pop();
        Ok(answer.unwrap_or_else(|| question.options.first().cloned().unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(prompt: &str, options: &[&str]) -> Question {
        Question {
            prompt: prompt.into(),
            options: options.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn auto_approve_picks_first_option() {
        let answer = AutoApproveInterviewer
            .ask(&question("Pick", &["Alpha", "Beta"]))
            .await
            .unwrap();
        assert_eq!(answer, "Alpha");
    }

    #[tokio::test]
    async fn recording_plays_back_in_order() {
        let interviewer = RecordingInterviewer::new(vec!["Yes".into(), "No".into()]);

        let a1 = interviewer.ask(&question("First?", &["Yes", "No"])).await.unwrap();
        let a2 = interviewer.ask(&question("Second?", &["Yes", "No"])).await.unwrap();
        assert_eq!(a1, "Yes");
        assert_eq!(a2, "No");

        let recorded = interviewer.questions();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].prompt, "First?");
        assert_eq!(recorded[1].prompt, "Second?");
    }

    #[tokio::test]
    async fn recording_falls_back_to_first_option() {
        let interviewer = RecordingInterviewer::new(vec![]);
        let answer = interviewer
            .ask(&question("Any?", &["Default", "Other"]))
            .await
            .unwrap();
        assert_eq!(answer, "Default");
    }
}
