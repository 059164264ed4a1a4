use flashline::{Response, Server, Shutdown};
use log::LevelFilter;
use simple_logger::SimpleLogger;

#[tokio::main]
async fn main() -> flashline::Result<()> {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init()
        .unwrap();

    let shutdown = Shutdown::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c.trigger();
    });

    Server::builder()
        .port(8080)
        .handler_fn0(|| Ok(Response::text("Hello, world!")))
        .on_listen(|addr| log::info!("try: curl http://{addr}/"))
        .signal(shutdown)
        .build()?
        .launch()
        .await
}
