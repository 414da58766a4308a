mod inbound_message;
mod ingested_record;

pub use inbound_message::InboundMessage;
pub use ingested_record::IngestedRecord;
