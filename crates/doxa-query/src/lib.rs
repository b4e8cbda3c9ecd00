//! Query executor, MV router, index registry, and mapper expressions for
//! Doxa.

pub mod executor;
pub mod index_registry;
pub mod mapper;
pub mod router;

pub use executor::{QueryExecutor, QueryOptions, QueryResult, QueryStats};
pub use index_registry::IndexRegistry;
pub use mapper::{Mapper, MapperRegistry};
pub use router::{InMemoryMvMetadataProvider, MvMetadataProvider, RoutePlan};
