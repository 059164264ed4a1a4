use flashline::{
    limits::{ConnLimits, ServerLimits, SlabPolicy},
    Response, Server,
};

// The default limits are conservative; a load test needs long-lived
// connections and one worker per core.
#[tokio::main]
async fn main() -> flashline::Result<()> {
    let workers = std::thread::available_parallelism().map_or(1, |n| n.get());

    Server::builder()
        .port(8080)
        .reuse_port(true)
        .handler_fn0(|| Ok(Response::text("Hello, world!")))
        .server_limits(ServerLimits {
            workers,
            slab: SlabPolicy::Growable { initial: 4096 },
            ..ServerLimits::default()
        })
        .connection_limits(ConnLimits {
            max_requests_per_connection: 1_000_000,
            max_pipelined: 64,
            ..ConnLimits::default()
        })
        .build()?
        .launch()
        .await
}
