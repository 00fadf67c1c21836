// 数据源路由
pub mod descriptor;
pub mod source_router;

pub use descriptor::{default_sources, SourceDescriptor};
pub use source_router::{
    BatchRouteOutcome, ProbeOutcome, RouteDecision, RouteRequest, RouterStatistics, RoutingStrategy, SourceProbe,
    SourceRouter,
};
