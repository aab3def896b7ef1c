// Shared harness: a wiremock server driven from synchronous tests. The
// clients under test are blocking, so they must not run inside an async
// context; the mock server gets its own runtime instead.

#![allow(dead_code)]

use tokio::runtime::Runtime;
use wiremock::{Mock, MockServer};

pub struct MockApi {
    pub server: MockServer,
    rt: Runtime,
}

impl MockApi {
    pub fn start() -> Self {
        let rt = Runtime::new().expect("tokio runtime");
        let server = rt.block_on(MockServer::start());
        MockApi { server, rt }
    }

    pub fn mount(&self, mock: Mock) {
        self.rt.block_on(mock.mount(&self.server));
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Number of requests the server has seen so far.
    pub fn request_count(&self) -> usize {
        self.rt
            .block_on(self.server.received_requests())
            .map(|r| r.len())
            .unwrap_or(0)
    }
}
