// axb-test-utils: Mock WebSocket endpoints for testing the bridge.
//
// Provides an appx-node mock (streams scripted frames, records inbound
// writes) and a bootstrap mock (serves one catalog exchange per connection).

pub mod mock_appx_server;
pub mod mock_bootstrap_server;

pub use mock_appx_server::{MockAppxOptions, MockAppxServer};
pub use mock_bootstrap_server::MockBootstrapServer;
