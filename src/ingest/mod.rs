// Stream ingestion
//
// Everything between "here's a stream URL" and "its chunks and
// transmissions are in storage": the decoder supervisor, the stderr event
// parser, the archiver state machine, and the executor that applies its
// operations.

mod archiver;
mod events;
mod executor;
mod parser;
mod preprocessor;
mod processor;

pub use archiver::{ArchiveOperation, AudioSpan};
pub use events::{ComponentMessage, PreprocessEvent};
pub use executor::ArchiveState;
pub use preprocessor::{preprocess, DECODER_COMMAND};
pub use processor::process_stream;
