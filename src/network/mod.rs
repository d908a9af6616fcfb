pub mod node;

use serde::{Deserialize, Serialize};

use crate::common::Result;
use crate::consensus::message::{
    AppVote, Block, CommitVote, GlobalBlockNumber, LaneProposal, LaneVote, PrepareVote, RoadIndex, Signed,
};
use crate::consensus::processor::ConsensusMessage;
use crate::consensus::qc::{AppQc, CommitQc, FullCommitQc, FullProposal, FullTimeoutVote, TimeoutQc};

/*
    Links between replicas are point-to-point, authenticated and reliable:
    the transport tells us who sent a message and delivers what a correct
    peer sent. Framing and stream multiplexing belong to the transport too;
    this module only fixes what travels over it.

    Safety never depends on timing. Progress needs the network to settle
    eventually so that messages between correct replicas arrive within a
    bound the view timeouts can outgrow.
*/

/// Everything replicas send each other. The encoded form is the bincode
/// encoding of this enum, so the variant index is the message tag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Ping(u64),
    Pong(u64),

    Proposal(FullProposal),
    PrepareVote(Signed<PrepareVote>),
    CommitVote(Signed<CommitVote>),
    TimeoutVote(FullTimeoutVote),
    TimeoutQc(TimeoutQc),

    LaneProposal(Signed<LaneProposal>),
    LaneVote(Signed<LaneVote>),
    CommitQc(CommitQc),
    /// Asks for the commit QC at a road index the sender is missing.
    CommitQcRequest(RoadIndex),
    AppVote(Signed<AppVote>),
    AppQc { app_qc: AppQc, commit_qc: CommitQc },

    FullCommitQc(FullCommitQc),
    BlockRequest(GlobalBlockNumber),
    BlockResponse { number: GlobalBlockNumber, block: Block },
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes one message. Unknown tags and trailing bytes are errors.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        use bincode::Options;
        Ok(bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .reject_trailing_bytes()
            .deserialize(bytes)?)
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Proposal(_) => "proposal",
            Message::PrepareVote(_) => "prepare_vote",
            Message::CommitVote(_) => "commit_vote",
            Message::TimeoutVote(_) => "timeout_vote",
            Message::TimeoutQc(_) => "timeout_qc",
            Message::LaneProposal(_) => "lane_proposal",
            Message::LaneVote(_) => "lane_vote",
            Message::CommitQc(_) => "commit_qc",
            Message::CommitQcRequest(_) => "commit_qc_request",
            Message::AppVote(_) => "app_vote",
            Message::AppQc { .. } => "app_qc",
            Message::FullCommitQc(_) => "full_commit_qc",
            Message::BlockRequest(_) => "block_request",
            Message::BlockResponse { .. } => "block_response",
        }
    }
}

impl From<ConsensusMessage> for Message {
    fn from(msg: ConsensusMessage) -> Self {
        match msg {
            ConsensusMessage::Proposal(p) => Message::Proposal(p),
            ConsensusMessage::PrepareVote(v) => Message::PrepareVote(v),
            ConsensusMessage::CommitVote(v) => Message::CommitVote(v),
            ConsensusMessage::TimeoutVote(v) => Message::TimeoutVote(v),
            ConsensusMessage::TimeoutQc(qc) => Message::TimeoutQc(qc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::crypto::Hash;
    use crate::common::Error;
    use crate::consensus::message::View;
    use crate::consensus::qc::testonly::Setup;

    #[test]
    fn test_proposal_survives_the_wire() {
        // Arrange
        let setup = Setup::new(4);
        let view = View::new(0, 0);
        let blocks = setup.blocks(1, 0, Hash::ZERO, 2);
        let lane_qc = setup.lane_qc(&blocks[1].header);
        let proposal = setup.proposal(view, None, &[vec![], blocks]);
        let msg = Message::Proposal(setup.full_proposal(view, proposal, vec![lane_qc], None));

        // Act
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();

        // Assert
        assert_eq!(decoded, msg);
        let Message::Proposal(full) = decoded else {
            panic!("wrong kind");
        };
        assert_eq!(full.verify(&setup.committee, &Default::default()), Ok(()));
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let mut bytes = Message::Ping(7).encode().unwrap();
        bytes[..4].copy_from_slice(&999u32.to_le_bytes());

        let err = Message::decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn test_truncated_and_padded_input_rejected() {
        let setup = Setup::new(4);
        let block = setup.blocks(0, 0, Hash::ZERO, 1).remove(0);
        let bytes = Message::BlockResponse { number: 3, block }.encode().unwrap();

        assert!(Message::decode(&bytes[..bytes.len() - 1]).is_err());
        let mut padded = bytes.clone();
        padded.push(0);
        assert!(Message::decode(&padded).is_err());
        assert!(Message::decode(&bytes).is_ok());
    }

    #[test]
    fn test_consensus_messages_map_one_to_one() {
        let setup = Setup::new(4);
        let tqc = setup.timeout_qc(View::new(2, 0), None);
        let msg: Message = ConsensusMessage::TimeoutQc(tqc.clone()).into();
        assert_eq!(msg, Message::TimeoutQc(tqc));
        assert_eq!(msg.kind(), "timeout_qc");
    }
}
