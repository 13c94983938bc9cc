use std::net::TcpListener;

use actix_web::{dev::Server, middleware::Logger, web, App, HttpServer};

use crate::{
    routes::{default_route, harvest_route},
    services::RunRegistry,
};

pub fn run(listener: TcpListener, registry: RunRegistry) -> Result<Server, std::io::Error> {
    let registry = web::Data::new(registry);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .service(default_route::default)
            .service(
                web::scope("/harvest")
                    .service(harvest_route::start_harvest)
                    .service(harvest_route::harvest_status)
                    .service(harvest_route::cancel_harvest),
            )
            .app_data(registry.clone())
    })
    .listen(listener)?
    .run();

    Ok(server)
}
