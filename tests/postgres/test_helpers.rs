use lazy_static::lazy_static;
use std::sync::Arc;
use testcontainers::{clients::Cli, Container};
use testcontainers_modules::postgres::Postgres;
use tokio_postgres::NoTls;

pub struct TestDatabase {
    pub connection_string: String,
    _container: Container<'static, Postgres>
}

impl TestDatabase {
    pub async fn new() -> Result<Self, Box<dyn std::error::Error>> {
        lazy_static! {
            static ref DOCKER: Arc<Cli> = Arc::new(Cli::default());
        }

        let container = DOCKER.run(Postgres::default());
        let port = container.get_host_port_ipv4(5432);
        let connection_string = format!("host=localhost port={} user=postgres password=postgres dbname=postgres", port);

        let (client, connection) = tokio_postgres::connect(&connection_string, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                eprintln!("database connection error: {e}");
            }
        });

        let schema = include_str!("../../migrations/0001_core_schema.sql");
        client.batch_execute(schema).await?;

        Ok(TestDatabase { connection_string, _container: container })
    }
}
