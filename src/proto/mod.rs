/// Generated client and server for the gateway's `Node` service.
pub mod gateway {
    tonic::include_proto!("gateway.v1");
}
