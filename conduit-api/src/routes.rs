use actix_web::web;

use crate::handlers;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(handlers::health)
        .service(handlers::migrate)
        .service(handlers::test_connection);
}
