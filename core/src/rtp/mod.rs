//! RTP/RTCP stack: stream management, reliable-UDP retransmit, RTCP
//! parsing, meta-info, and sequence-number duplicate detection
//! (SPEC_FULL.md §4.8–§4.11, §4.15).

pub mod meta_info;
pub mod retransmit;
pub mod rtcp;
pub mod seqmap;
pub mod stream;

pub use retransmit::RtpResender;
pub use rtcp::{parse_compound, RtcpReport};
pub use seqmap::SequenceNumberMap;
pub use stream::{QualitySignal, RtpStream, StreamStats};
