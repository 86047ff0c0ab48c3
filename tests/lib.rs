//! Shared fixtures for BB84 Net integration tests

pub mod fixtures {
    //! Multi-node test fixtures

    pub mod two_node;

    pub use two_node::TwoNodeFixture;
}
