//! Approval of split proposals.

use std::io::{self, BufRead, Write};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

use super::SplitProposal;

/// Answer to a split proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum SplitDecision {
    Approve,
    Reject { reason: String },
}

impl SplitDecision {
    pub fn reject(reason: impl Into<String>) -> Self {
        SplitDecision::Reject {
            reason: reason.into(),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, SplitDecision::Approve)
    }
}

/// Decides whether a proposal takes effect.
#[async_trait]
pub trait SplitApprover: Send + Sync {
    async fn decide(&self, proposal: &SplitProposal) -> SplitDecision;
}

/// Approves everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprover;

#[async_trait]
impl SplitApprover for AutoApprover {
    async fn decide(&self, proposal: &SplitProposal) -> SplitDecision {
        info!(story_id = %proposal.story_id, "split auto-approved");
        SplitDecision::Approve
    }
}

/// A proposal waiting for an external answer.
#[derive(Debug)]
pub struct SplitRequest {
    pub proposal: SplitProposal,
    pub respond: oneshot::Sender<SplitDecision>,
}

/// Forwards proposals over a channel and waits for the reply.
///
/// A closed channel, a dropped responder or an expired timeout all count as
/// a rejection so the worker is never stuck on approval.
#[derive(Debug, Clone)]
pub struct ChannelApprover {
    sender: mpsc::Sender<SplitRequest>,
    timeout: Option<Duration>,
}

impl ChannelApprover {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<SplitRequest>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (
            Self {
                sender,
                timeout: None,
            },
            receiver,
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl SplitApprover for ChannelApprover {
    async fn decide(&self, proposal: &SplitProposal) -> SplitDecision {
        let (respond, answer) = oneshot::channel();
        let request = SplitRequest {
            proposal: proposal.clone(),
            respond,
        };
        if self.sender.send(request).await.is_err() {
            warn!(story_id = %proposal.story_id, "approval channel closed");
            return SplitDecision::reject("approval channel closed");
        }

        let answer = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, answer).await {
                Ok(answer) => answer,
                Err(_) => {
                    warn!(story_id = %proposal.story_id, "split approval timed out");
                    return SplitDecision::reject("approval timed out");
                }
            },
            None => answer.await,
        };
        answer.unwrap_or_else(|_| SplitDecision::reject("approver went away"))
    }
}

/// Asks on the terminal. Prompts are serialised across workers.
#[derive(Debug, Default)]
pub struct StdinApprover {
    prompt_lock: Mutex<()>,
}

impl StdinApprover {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SplitApprover for StdinApprover {
    async fn decide(&self, proposal: &SplitProposal) -> SplitDecision {
        let _guard = self.prompt_lock.lock().await;
        let summary = describe(proposal);
        let answer = tokio::task::spawn_blocking(move || -> io::Result<String> {
            let mut stderr = io::stderr();
            write!(stderr, "{}Apply this split? [y/N] ", summary)?;
            stderr.flush()?;
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            Ok(line)
        })
        .await;

        match answer {
            Ok(Ok(line)) if parse_answer(&line) => SplitDecision::Approve,
            Ok(Ok(_)) => SplitDecision::reject("declined by operator"),
            Ok(Err(e)) => SplitDecision::reject(format!("could not read answer: {}", e)),
            Err(e) => SplitDecision::reject(format!("prompt task failed: {}", e)),
        }
    }
}

fn parse_answer(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Human-readable rendering of a proposal.
pub fn describe(proposal: &SplitProposal) -> String {
    let mut out = format!("Split proposal for {}:\n", proposal.story_id);
    if let Some(carry) = &proposal.carry_forward {
        out.push_str(&format!(
            "  {} {} [passed] ({} criteria)\n",
            carry.id,
            carry.title,
            carry.criteria.len()
        ));
    }
    for child in &proposal.children {
        out.push_str(&format!("  {} {}\n", child.id, child.title));
        for criterion in &child.criteria {
            out.push_str(&format!("    - {} {}\n", criterion.id, criterion.description));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::AcceptanceCriterion;
    use crate::split::ProposedStory;

    fn proposal() -> SplitProposal {
        let child = |n: usize| ProposedStory {
            id: format!("US-001.{}", n),
            title: format!("part {}", n),
            criteria: vec![AcceptanceCriterion::new(format!("AC{}", n), "do it", 10)],
        };
        SplitProposal {
            story_id: "US-001".to_string(),
            children: vec![child(1), child(2)],
            carry_forward: None,
        }
    }

    #[tokio::test]
    async fn test_auto_approver_approves() {
        assert!(AutoApprover.decide(&proposal()).await.is_approved());
    }

    #[tokio::test]
    async fn test_channel_approver_round_trip() {
        let (approver, mut requests) = ChannelApprover::new(4);
        let responder = tokio::spawn(async move {
            let request = requests.recv().await.expect("request");
            assert_eq!(request.proposal.story_id, "US-001");
            request
                .respond
                .send(SplitDecision::reject("too early"))
                .unwrap();
        });

        let decision = approver.decide(&proposal()).await;
        responder.await.unwrap();
        assert_eq!(decision, SplitDecision::reject("too early"));
    }

    #[tokio::test]
    async fn test_channel_approver_rejects_when_closed() {
        let (approver, requests) = ChannelApprover::new(1);
        drop(requests);
        assert!(!approver.decide(&proposal()).await.is_approved());
    }

    #[tokio::test]
    async fn test_channel_approver_timeout() {
        let (approver, _requests) = ChannelApprover::new(1);
        let approver = approver.with_timeout(Duration::from_millis(20));
        let decision = approver.decide(&proposal()).await;
        assert_eq!(decision, SplitDecision::reject("approval timed out"));
    }

    #[test]
    fn test_parse_answer() {
        assert!(parse_answer("y\n"));
        assert!(parse_answer(" YES "));
        assert!(!parse_answer("n"));
        assert!(!parse_answer(""));
    }

    #[test]
    fn test_describe_lists_children() {
        let text = describe(&proposal());
        assert!(text.contains("US-001.1 part 1"));
        assert!(text.contains("- AC2 do it"));
    }
}
