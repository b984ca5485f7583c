use crowd_common::{PolyRef, Vec3};
use crowd_engine::{NavQuery, QueryFilter};

/// Navigation data the crowd manager runs on
///
/// Batch scopes may be opened by `&self` so implementations that group
/// queries keep their bookkeeping behind interior mutability.
pub trait NavDataAdapter {
    /// False while the navigation data is being built or is absent
    fn is_ready(&self) -> bool;

    /// Projects `point` onto the navigation data within `extent`
    fn project_point(
        &self,
        point: Vec3,
        extent: Vec3,
        filter: &QueryFilter,
    ) -> Option<(Vec3, PolyRef)>;

    fn default_query_extent(&self) -> Vec3;

    fn default_query_filter(&self) -> QueryFilter {
        QueryFilter::default()
    }

    fn begin_batch_query(&self) {}

    fn finish_batch_query(&self) {}

    /// User id of a custom link, `None` for polygons and plain links
    fn custom_link_id(&self, poly: PolyRef) -> Option<u32>;

    fn query(&self) -> &dyn NavQuery;
}

/// Path computed outside the crowd
#[derive(Debug, Clone, Default)]
pub struct NavMeshPath {
    pub points: Vec<Vec3>,
    /// Polygons the path crosses, in order
    pub corridor: Vec<PolyRef>,
    /// Filter the path was computed with
    pub filter: Option<QueryFilter>,
}

impl NavMeshPath {
    pub fn new(points: Vec<Vec3>, corridor: Vec<PolyRef>) -> Self {
        Self {
            points,
            corridor,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: QueryFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// RAII scope around a batch of navigation queries
pub(crate) struct BatchQuery<'a> {
    nav: &'a dyn NavDataAdapter,
}

impl<'a> BatchQuery<'a> {
    pub(crate) fn begin(nav: &'a dyn NavDataAdapter) -> Self {
        nav.begin_batch_query();
        Self { nav }
    }
}

impl Drop for BatchQuery<'_> {
    fn drop(&mut self) {
        self.nav.finish_batch_query();
    }
}
