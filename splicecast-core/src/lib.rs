pub mod config;
pub mod delivery;
pub mod error;
pub mod placeholder;
pub mod process;
pub mod profile;
pub mod splice;
pub mod supervisor;
pub mod switch;

pub use config::{
    load_splicecast_config, CommandTemplate, CommandsSection, HlsSection, PathsSection,
    SplicecastConfig, SupervisorSection, SwitchSection, TcpSection,
};
pub use delivery::{
    BroadcastSink, ChunkSink, HlsError, HlsRepackager, HlsSettings, SegmentEntry, SinkError,
    TcpBroadcaster, TcpSettings, WriterSink,
};
pub use error::{ConfigError, Result};
pub use placeholder::{encoder_options, PlaceholderBuild};
pub use process::{CommandDescriptor, ProcessChain, ProcessError, TemplateVars};
pub use profile::{ProfileRegistry, TranscodeProfile};
pub use splice::{ContinuitySplicer, ProtocolError, SpliceState, SplicingSink};
pub use supervisor::{
    Operation, OperationState, PipelineMetrics, RestartStrategy, Supervisor, SupervisorError,
    SupervisorResult,
};
pub use switch::{
    Feed, HandoverError, HandoverSink, Passthrough, ReaderFeed, Source, Switch, SwitchError,
    SwitchOutcome, SwitchSettings,
};
