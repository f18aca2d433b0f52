// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for MongoDB.
//!
//! Change streams need a replica set, so the source container runs
//! `mongod --replSet rs0` and is initiated as a single-member set.

use bson::doc;
use std::time::Duration;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage, RunnableImage};

const MONGO_PORT: u16 = 27017;
const REPLICA_SET: &str = "rs0";

fn mongo_image() -> GenericImage {
    GenericImage::new("mongo", "7.0")
        .with_exposed_port(MONGO_PORT)
        .with_wait_for(WaitFor::message_on_stdout("Waiting for connections"))
}

/// A standalone MongoDB container (enough for a destination).
pub fn mongo_container(docker: &Cli) -> Container<'_, GenericImage> {
    docker.run(mongo_image())
}

/// A MongoDB container started as a replica set member. Call
/// [`initiate_replica_set`] before watching it.
pub fn mongo_replica_container(docker: &Cli) -> Container<'_, GenericImage> {
    let args = vec![
        "--replSet".to_string(),
        REPLICA_SET.to_string(),
        "--bind_ip_all".to_string(),
    ];
    docker.run(RunnableImage::from((mongo_image(), args)))
}

/// Connection string for a container, bypassing replica set discovery.
pub fn mongo_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(MONGO_PORT);
    format!("mongodb://127.0.0.1:{}/?directConnection=true", port)
}

/// Initiate a single-member replica set and wait for it to elect itself.
pub async fn initiate_replica_set(url: &str) {
    let client = mongodb::Client::with_uri_str(url)
        .await
        .expect("Failed to create client");
    let admin = client.database("admin");

    admin
        .run_command(
            doc! {
                "replSetInitiate": {
                    "_id": REPLICA_SET,
                    "members": [{ "_id": 0, "host": format!("127.0.0.1:{}", MONGO_PORT) }],
                }
            },
            None,
        )
        .await
        .expect("replSetInitiate failed");

    for _ in 0..100 {
        let hello = admin.run_command(doc! { "hello": 1 }, None).await;
        if let Ok(reply) = hello {
            if reply.get_bool("isWritablePrimary").unwrap_or(false) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    panic!("replica set did not elect a primary");
}

/// Source (replica set) and destination containers for one test.
pub struct TestDeployment<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    source: Container<'a, GenericImage>,
    #[allow(dead_code)]
    destination: Container<'a, GenericImage>,
    pub source_url: String,
    pub destination_url: String,
}

impl<'a> TestDeployment<'a> {
    pub async fn start(docker: &'a Cli) -> TestDeployment<'a> {
        let source = mongo_replica_container(docker);
        let source_url = mongo_url(&source);
        initiate_replica_set(&source_url).await;

        let destination = mongo_container(docker);
        let destination_url = mongo_url(&destination);
        Self {
            source,
            destination,
            source_url,
            destination_url,
        }
    }
}
