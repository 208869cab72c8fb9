// Transport module — radio capability, mesh service and the simulated medium

pub mod heartbeat;
pub mod mesh;
pub mod radio;
pub mod sim;

pub use heartbeat::HeartbeatPolicy;
pub use mesh::{InboundMessage, MeshError, MeshEvent, MeshState, MeshStats, MeshTransport};
pub use radio::{Advertisement, RadioError, RadioTransport};
pub use sim::{SimRadio, SimulatedAir};
