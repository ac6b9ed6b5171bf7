//! Interactive chat in one conversation.

use std::collections::HashSet;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use duet_core::{CoreError, DeliveryOrchestrator, DisplayMessage, Progress};
use duet_proto::MessageId;

use crate::output::OutputFormatter;

const PEER_KEY_POLL: Duration = Duration::from_secs(3);

/// Prints each visible message exactly once, even when reconciliation
/// rebuilds the list.
pub struct Printer {
    printed: HashSet<MessageId>,
}

impl Printer {
    pub fn new() -> Self {
        Self {
            printed: HashSet::new(),
        }
    }

    /// Lines for messages not printed before, in list order.
    pub fn pending_lines(&mut self, formatter: &OutputFormatter, visible: &[DisplayMessage]) -> Vec<String> {
        visible
            .iter()
            .filter(|m| self.printed.insert(m.id))
            .map(|m| formatter.format_message(m))
            .filter(|line| !line.is_empty())
            .collect()
    }

    fn flush(&mut self, formatter: &OutputFormatter, visible: &[DisplayMessage]) {
        for line in self.pending_lines(formatter, visible) {
            println!("{line}");
        }
    }
}

impl Default for Printer {
    fn default() -> Self {
        Self::new()
    }
}

/// Open the conversation and relay stdin lines until EOF, `/quit` or
/// Ctrl-C.
pub async fn run(mut orch: DeliveryOrchestrator, formatter: &OutputFormatter) -> anyhow::Result<()> {
    if orch.start().await? == Progress::WaitingForPeer {
        eprintln!("Waiting for the other participant to publish a key...");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(PEER_KEY_POLL) => {}
                _ = tokio::signal::ctrl_c() => {
                    orch.close().await;
                    return Ok(());
                }
            }
            if orch.retry_peer_key().await? == Progress::Live {
                break;
            }
        }
    }

    if let Some(peer) = orch.peer() {
        eprintln!("Chatting with {}. Type /quit to leave.", peer.username);
    }
    let mut printer = Printer::new();
    printer.flush(formatter, orch.visible());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim();
                if text == "/quit" {
                    break;
                }
                if text.is_empty() {
                    continue;
                }
                if let Err(e) = orch.send(text).await {
                    eprintln!("Send failed: {e}");
                }
            }
            result = orch.pump() => {
                if let Err(e) = result {
                    if let CoreError::Rejected(reason) = &e {
                        eprintln!("Message not delivered: {reason}");
                        continue;
                    }
                    if !e.is_recoverable() {
                        orch.close().await;
                        return Err(e.into());
                    }
                    warn!("live channel: {}", e);
                }
                printer.flush(formatter, orch.visible());
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    orch.close().await;
    Ok(())
}
