use flashline::{HandlerError, Method, Request, Response, Server, StatusCode};
use log::LevelFilter;
use simple_logger::SimpleLogger;

async fn echo(req: Request) -> Result<Response, HandlerError> {
    if req.method() != Method::Post {
        return Ok(Response::new(StatusCode::MethodNotAllowed).header("Allow", "POST"));
    }

    let peer = req.remote_addr();
    log::info!("{} from {}:{}", req.url()?, peer.ip, peer.port);

    Ok(match req.body()? {
        // Chunked uploads are echoed back chunk by chunk
        Some(body) => Response::new(StatusCode::Ok)
            .header("Content-Type", "application/octet-stream")
            .stream(body),
        None => Response::new(StatusCode::BadRequest).body("expected a body"),
    })
}

#[tokio::main]
async fn main() -> flashline::Result<()> {
    SimpleLogger::new()
        .with_level(LevelFilter::Debug)
        .init()
        .unwrap();

    Server::builder()
        .port(8080)
        .handler_async(echo)
        .on_listen(|addr| {
            log::info!("try: curl -T - -H 'Transfer-Encoding: chunked' http://{addr}/")
        })
        .build()?
        .launch()
        .await
}
