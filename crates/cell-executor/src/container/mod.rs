pub mod backend;
pub mod spec;

pub use backend::{
    BackendContainerSpec, ByteStream, Container, ContainerBackend, ContainerInfo, Process,
    ProcessIo, ProcessSpec, Signal, StreamSpec,
};
pub use spec::{
    BindMount, BindMountMode, BindMountOrigin, CachedDependency, Check, CheckDefinition, CheckError,
    ContainerSpec, HttpCheck, PortMapping, TcpCheck,
};
