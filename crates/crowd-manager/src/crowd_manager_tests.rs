//! Behaviour tests for the crowd manager
//!
//! These tests drive the manager over a grid navigation mesh with mock
//! agents that move themselves from the velocities they are given.

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use crowd_common::{PolyRef, Vec3, dist_2d};
    use crowd_engine::test_nav::GridNavMesh;
    use crowd_engine::{
        Crowd, CrowdAgentState, CrowdConfig, LinkFilter, MoveRequestState, NavQuery,
        QueryFilter, UpdateFlags,
    };

    use crate::{
        AvoidanceConfig, CrowdAgent, CrowdBackend, CrowdEngineBackend, CrowdManager,
        CrowdManagerConfig, NavDataAdapter, NavMeshPath, NullBackend, SimulatedCrowdAgent,
    };

    /// Navigation data over a grid mesh that counts batch scopes
    struct GridNavData {
        mesh: GridNavMesh,
        ready: AtomicBool,
        custom_links: bool,
        batches: AtomicUsize,
    }

    impl GridNavData {
        fn new(mesh: GridNavMesh) -> Arc<Self> {
            Arc::new(Self {
                mesh,
                ready: AtomicBool::new(true),
                custom_links: false,
                batches: AtomicUsize::new(0),
            })
        }

        fn with_custom_links(mesh: GridNavMesh) -> Arc<Self> {
            Arc::new(Self {
                mesh,
                ready: AtomicBool::new(true),
                custom_links: true,
                batches: AtomicUsize::new(0),
            })
        }

        fn batch_count(&self) -> usize {
            self.batches.load(Ordering::SeqCst)
        }
    }

    impl NavDataAdapter for GridNavData {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn project_point(
            &self,
            point: Vec3,
            extent: Vec3,
            filter: &QueryFilter,
        ) -> Option<(Vec3, PolyRef)> {
            self.mesh
                .find_nearest_poly(point, extent, filter)
                .map(|(poly, pos)| (pos, poly))
        }

        fn default_query_extent(&self) -> Vec3 {
            Vec3::ONE
        }

        fn begin_batch_query(&self) {
            self.batches.fetch_add(1, Ordering::SeqCst);
        }

        fn custom_link_id(&self, poly: PolyRef) -> Option<u32> {
            if self.custom_links {
                self.mesh.link_user_id(poly)
            } else {
                None
            }
        }

        fn query(&self) -> &dyn NavQuery {
            &self.mesh
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Velocity {
            velocity: Vec3,
            dest: Vec3,
            using_link: bool,
        },
        Position(Vec3),
        NodeChanged {
            new_poly: PolyRef,
            prev_poly: PolyRef,
            corridor_size: usize,
        },
        CustomLink {
            link_id: u32,
            dest: Vec3,
        },
    }

    struct TestAgent {
        location: Mutex<Vec3>,
        velocity: Mutex<Vec3>,
        radius: f32,
        query_range: f32,
        max_speed: f32,
        link_filter: Option<Arc<dyn LinkFilter>>,
        events: Mutex<Vec<Event>>,
    }

    impl TestAgent {
        fn new(pos: Vec3) -> Arc<Self> {
            Arc::new(Self::build(pos, 3.0, None))
        }

        /// Registered for avoidance but never steered
        fn obstacle(pos: Vec3) -> Arc<Self> {
            Arc::new(Self::build(pos, 0.0, None))
        }

        fn with_link_filter(pos: Vec3, filter: Arc<dyn LinkFilter>) -> Arc<Self> {
            Arc::new(Self::build(pos, 3.0, Some(filter)))
        }

        fn build(pos: Vec3, query_range: f32, link_filter: Option<Arc<dyn LinkFilter>>) -> Self {
            Self {
                location: Mutex::new(pos),
                velocity: Mutex::new(Vec3::ZERO),
                radius: 0.3,
                query_range,
                max_speed: 2.0,
                link_filter,
                events: Mutex::new(Vec::new()),
            }
        }

        fn handle(self: &Arc<Self>) -> Arc<dyn CrowdAgent> {
            self.clone()
        }

        /// Moves the agent by its last applied velocity
        fn integrate(&self, dt: f32) {
            let vel = *self.velocity.lock().unwrap();
            *self.location.lock().unwrap() += vel * dt;
        }

        fn set_location(&self, pos: Vec3) {
            *self.location.lock().unwrap() = pos;
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn last_velocity(&self) -> Option<Vec3> {
            self.events().iter().rev().find_map(|e| match e {
                Event::Velocity { velocity, .. } => Some(*velocity),
                _ => None,
            })
        }
    }

    impl CrowdAgent for TestAgent {
        fn location(&self) -> Vec3 {
            *self.location.lock().unwrap()
        }

        fn velocity(&self) -> Vec3 {
            *self.velocity.lock().unwrap()
        }

        fn max_speed(&self) -> f32 {
            self.max_speed
        }

        fn collision_radii(&self) -> (f32, f32) {
            (self.radius, 1.0)
        }

        fn as_simulated(&self) -> Option<&dyn SimulatedCrowdAgent> {
            Some(self)
        }
    }

    impl SimulatedCrowdAgent for TestAgent {
        fn collision_query_range(&self) -> f32 {
            self.query_range
        }

        fn path_optimization_range(&self) -> f32 {
            10.0
        }

        fn update_flags(&self) -> UpdateFlags {
            UpdateFlags::ANTICIPATE_TURNS
                | UpdateFlags::OBSTACLE_AVOIDANCE
                | UpdateFlags::SEPARATION
                | UpdateFlags::OPTIMIZE_VIS
                | UpdateFlags::SLOWDOWN_AT_GOAL
        }

        fn link_filter(&self) -> Option<Arc<dyn LinkFilter>> {
            self.link_filter.clone()
        }

        fn apply_crowd_agent_velocity(&self, new_velocity: Vec3, dest: Vec3, is_using_link: bool) {
            *self.velocity.lock().unwrap() = new_velocity;
            self.events.lock().unwrap().push(Event::Velocity {
                velocity: new_velocity,
                dest,
                using_link: is_using_link,
            });
        }

        fn apply_crowd_agent_position(&self, new_position: Vec3) {
            *self.location.lock().unwrap() = new_position;
            self.events.lock().unwrap().push(Event::Position(new_position));
        }

        fn on_nav_node_changed(&self, new_poly: PolyRef, prev_poly: PolyRef, corridor_size: usize) {
            self.events.lock().unwrap().push(Event::NodeChanged {
                new_poly,
                prev_poly,
                corridor_size,
            });
        }

        fn start_using_custom_link(&self, link_id: u32, dest: Vec3) {
            self.events
                .lock()
                .unwrap()
                .push(Event::CustomLink { link_id, dest });
        }
    }

    /// Agent that only exposes the basic capability set
    struct Pillar(Vec3);

    impl CrowdAgent for Pillar {
        fn location(&self) -> Vec3 {
            self.0
        }

        fn velocity(&self) -> Vec3 {
            Vec3::ZERO
        }

        fn max_speed(&self) -> f32 {
            0.0
        }

        fn collision_radii(&self) -> (f32, f32) {
            (0.5, 1.0)
        }
    }

    struct AllowAll;

    impl LinkFilter for AllowAll {
        fn is_link_allowed(&self, _link_user_id: u32) -> bool {
            true
        }
    }

    /// Backend that records what the proximity hook sees
    struct ProbeBackend {
        seen: Arc<Mutex<Vec<(usize, Vec3)>>>,
    }

    impl CrowdBackend for ProbeBackend {
        fn create_crowd(&self, config: &CrowdConfig) -> Option<Crowd> {
            CrowdEngineBackend.create_crowd(config)
        }

        fn post_proximity_update(&self, crowd: &mut Crowd, _dt: f32) {
            let mut seen = self.seen.lock().unwrap();
            for i in 0..crowd.agent_capacity() {
                if let Some(ag) = crowd.agent(i).filter(|ag| ag.active) {
                    seen.push((ag.neighbours.len(), ag.dvel));
                }
            }
        }
    }

    fn config() -> CrowdManagerConfig {
        CrowdManagerConfig::new()
            .with_max_agents(8)
            .with_max_agent_radius(1.0)
    }

    fn manager_on(nav: &Arc<GridNavData>) -> CrowdManager {
        let mut manager = CrowdManager::new(config());
        manager.set_nav_data(nav.clone());
        manager
    }

    fn open_grid() -> Arc<GridNavData> {
        GridNavData::new(GridNavMesh::new(10, 10, 1.0))
    }

    fn center(x: i32, z: i32) -> Vec3 {
        Vec3::new(x as f32 + 0.5, 0.0, z as f32 + 0.5)
    }

    fn engine_agent<'a>(
        manager: &'a CrowdManager,
        agent: &dyn CrowdAgent,
    ) -> &'a crowd_engine::CrowdAgent {
        let idx = manager.agent_index(agent).unwrap();
        manager.crowd().unwrap().agent(idx).unwrap()
    }

    fn run(manager: &mut CrowdManager, agents: &[&Arc<TestAgent>], ticks: usize, dt: f32) {
        for _ in 0..ticks {
            manager.tick(dt);
            for agent in agents {
                agent.integrate(dt);
            }
        }
    }

    #[test]
    fn test_registration_before_nav_data() {
        let mut manager = CrowdManager::new(config());
        let agent = TestAgent::new(center(1, 1));
        assert!(manager.register_agent(&agent.handle()));
        assert!(manager.is_agent_valid(&*agent));
        assert!(!manager.is_ready());
        assert_eq!(manager.agent_index(&*agent), None);

        let nav = open_grid();
        manager.set_nav_data(nav.clone());
        assert!(manager.is_ready());
        assert_eq!(manager.active_agent_count(), 1);
        assert!(manager.agent_index(&*agent).is_some());
    }

    #[test]
    fn test_nav_data_not_ready_defers_creation() {
        let nav = open_grid();
        nav.ready.store(false, Ordering::SeqCst);
        let mut manager = manager_on(&nav);
        let agent = TestAgent::new(center(1, 1));
        manager.register_agent(&agent.handle());
        assert!(!manager.is_ready());
        assert!(!manager.set_agent_move_target(&*agent, center(5, 5), None));

        nav.ready.store(true, Ordering::SeqCst);
        manager.on_nav_data_updated();
        assert!(manager.is_ready());
        assert!(manager.set_agent_move_target(&*agent, center(5, 5), None));
    }

    #[test]
    fn test_register_unregister_releases_filter() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        let filter: Arc<dyn LinkFilter> = Arc::new(AllowAll);
        let agent = TestAgent::with_link_filter(center(2, 2), filter.clone());
        let baseline = Arc::strong_count(&filter);
        let count = manager.registered_agent_count();

        assert!(manager.register_agent(&agent.handle()));
        assert!(Arc::strong_count(&filter) > baseline);
        assert_eq!(manager.registered_agent_count(), count + 1);

        assert!(manager.unregister_agent(&*agent));
        assert_eq!(Arc::strong_count(&filter), baseline);
        assert_eq!(manager.registered_agent_count(), count);
        assert!(!manager.is_agent_valid(&*agent));
        assert_eq!(manager.active_agent_count(), 0);
        assert!(!manager.unregister_agent(&*agent));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        let agent = TestAgent::new(center(2, 2));
        assert!(manager.register_agent(&agent.handle()));
        assert!(!manager.register_agent(&agent.handle()));
        assert_eq!(manager.registered_agent_count(), 1);
        assert_eq!(manager.active_agent_count(), 1);
    }

    #[test]
    fn test_move_target_rejected_for_unknown_and_obstacles() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        let stranger = TestAgent::new(center(1, 1));
        assert!(!manager.set_agent_move_target(&*stranger, center(5, 5), None));

        let obstacle = TestAgent::obstacle(center(2, 2));
        manager.register_agent(&obstacle.handle());
        assert!(manager.is_agent_valid(&*obstacle));
        assert!(!manager.is_agent_simulated(&*obstacle));
        assert!(!manager.set_agent_move_target(&*obstacle, center(5, 5), None));
        assert!(!manager.set_agent_move_direction(&*obstacle, Vec3::X));
        assert!(!manager.pause_agent(&*obstacle));

        let ag = engine_agent(&manager, &*obstacle);
        assert_eq!(ag.target_state, MoveRequestState::None);
        assert!(!ag.target_ref.is_valid());
    }

    #[test]
    fn test_agent_reaches_move_target() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        let agent = TestAgent::new(center(0, 0));
        manager.register_agent(&agent.handle());
        assert!(manager.set_agent_move_target(&*agent, center(5, 5), None));

        run(&mut manager, &[&agent], 200, 0.1);

        assert!(dist_2d(agent.location(), center(5, 5)) < 0.3);
        let ag = engine_agent(&manager, &*agent);
        assert_eq!(ag.target_state, MoveRequestState::Valid);

        let last_node = agent.events().iter().rev().find_map(|e| match e {
            Event::NodeChanged { new_poly, .. } => Some(*new_poly),
            _ => None,
        });
        assert_eq!(last_node, Some(nav.mesh.cell_ref(5, 5)));
    }

    #[test]
    fn test_failed_projection_keeps_target() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        let agent = TestAgent::new(center(0, 0));
        manager.register_agent(&agent.handle());
        assert!(manager.set_agent_move_target(&*agent, center(5, 5), None));
        assert!(!manager.set_agent_move_target(&*agent, Vec3::new(50.0, 0.0, 50.0), None));

        let ag = engine_agent(&manager, &*agent);
        assert_eq!(ag.target_ref, nav.mesh.cell_ref(5, 5));
        assert_eq!(ag.target_state, MoveRequestState::Requesting);
    }

    #[test]
    fn test_move_direction_uses_max_speed() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        let agent = TestAgent::new(center(4, 4));
        manager.register_agent(&agent.handle());
        assert!(manager.set_agent_move_direction(&*agent, Vec3::X));

        let ag = engine_agent(&manager, &*agent);
        assert_eq!(ag.target_state, MoveRequestState::Velocity);
        assert_eq!(ag.target_pos, Vec3::new(2.0, 0.0, 0.0));

        run(&mut manager, &[&agent], 5, 0.1);
        assert!(agent.location().x > center(4, 4).x + 0.5);
    }

    #[test]
    fn test_move_path_section() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        let agent = TestAgent::new(center(1, 0));
        manager.register_agent(&agent.handle());

        let corridor: Vec<PolyRef> = (0..4).map(|x| nav.mesh.cell_ref(x, 0)).collect();
        let path = NavMeshPath::new(vec![center(0, 0), center(3, 0)], corridor.clone());

        assert!(manager.set_agent_move_path(&*agent, &path, 0, 3));
        let ag = engine_agent(&manager, &*agent);
        assert_eq!(ag.corridor.get_path(), corridor.as_slice());
        assert_eq!(ag.corridor.get_target(), center(3, 0));
        assert_eq!(ag.target_state, MoveRequestState::Valid);

        // A section ending early targets the centre of its last polygon
        assert!(manager.set_agent_move_path(&*agent, &path, 1, 2));
        let ag = engine_agent(&manager, &*agent);
        assert_eq!(ag.corridor.get_path(), &corridor[1..=2]);
        assert_eq!(ag.corridor.get_target(), center(2, 0));
        assert_eq!(ag.target_ref, nav.mesh.cell_ref(2, 0));

        assert!(!manager.set_agent_move_path(&*agent, &path, 2, 4));
        assert!(!manager.set_agent_move_path(&*agent, &path, 3, 1));
        let short = NavMeshPath::new(vec![center(0, 0)], corridor);
        assert!(!manager.set_agent_move_path(&*agent, &short, 0, 1));
    }

    #[test]
    fn test_adjust_path_start() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        let agent = TestAgent::new(center(2, 0));
        manager.register_agent(&agent.handle());

        let corridor: Vec<PolyRef> = (0..5).map(|x| nav.mesh.cell_ref(x, 0)).collect();
        let path = NavMeshPath::new(vec![center(0, 0), center(4, 0)], corridor);
        let mut start = 0;
        assert!(manager.adjust_agent_path_start(&*agent, &path, &mut start));
        assert_eq!(start, 2);

        let elsewhere = NavMeshPath::new(
            vec![center(0, 5), center(3, 5)],
            (0..4).map(|x| nav.mesh.cell_ref(x, 5)).collect(),
        );
        let mut start = 1;
        assert!(!manager.adjust_agent_path_start(&*agent, &elsewhere, &mut start));
        assert_eq!(start, 1);
    }

    #[test]
    fn test_avoidance_config_table() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        assert_eq!(manager.avoidance_config_count(), 4);

        let profile = AvoidanceConfig::adaptive(6, 2, 2);
        assert!(manager.set_avoidance_config(4, &profile));
        assert_eq!(manager.avoidance_config_count(), 5);

        assert!(!manager.set_avoidance_config(9, &profile));
        assert!(!manager.set_avoidance_config(6, &profile));
        assert_eq!(manager.avoidance_config_count(), 5);

        let mut tuned = AvoidanceConfig::adaptive(8, 3, 1);
        tuned.side_bias_weight = 1.5;
        assert!(manager.set_avoidance_config(1, &tuned));
        assert_eq!(manager.avoidance_config(1), Some(&tuned));
        assert_eq!(
            manager.crowd().unwrap().obstacle_avoidance_params(1),
            Some(&tuned.to_params())
        );

        let mut negative = tuned;
        negative.impact_time_weight = -0.5;
        assert!(!manager.set_avoidance_config(1, &negative));
        assert_eq!(manager.avoidance_config(1), Some(&tuned));

        let dangling = AvoidanceConfig::default().with_custom_pattern(0);
        assert!(!manager.set_avoidance_config(2, &dangling));
    }

    #[test]
    fn test_avoidance_table_capacity() {
        let mut manager = CrowdManager::new(config());
        for idx in 4..8 {
            assert!(manager.set_avoidance_config(idx, &AvoidanceConfig::default()));
        }
        assert_eq!(manager.avoidance_config_count(), 8);
        assert!(!manager.set_avoidance_config(8, &AvoidanceConfig::default()));
        assert_eq!(manager.avoidance_config_count(), 8);
    }

    #[test]
    fn test_custom_pattern_profile_is_pushed() {
        let mut pattern = crowd_engine::SamplingPattern::new();
        pattern.add_sample_with_mirror(30.0, 1.0);
        pattern.add_sample(0.0, 0.5);
        let config = config()
            .with_sampling_pattern(pattern.clone())
            .with_avoidance_configs(vec![AvoidanceConfig::default().with_custom_pattern(0)]);

        let nav = open_grid();
        let mut manager = CrowdManager::new(config);
        manager.set_nav_data(nav.clone());

        assert_eq!(manager.sampling_pattern_count(), 1);
        let crowd = manager.crowd().unwrap();
        assert_eq!(crowd.sampling_pattern(0), Some(&pattern));
        assert_eq!(crowd.obstacle_avoidance_params(0).unwrap().pattern_idx, Some(0));
        assert!(manager.set_avoidance_config(1, &AvoidanceConfig::default().with_custom_pattern(0)));
    }

    #[test]
    fn test_tick_without_agents_skips_batch() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        manager.tick(0.1);
        assert_eq!(nav.batch_count(), 0);

        let pillar: Arc<dyn CrowdAgent> = Arc::new(Pillar(center(3, 3)));
        manager.register_agent(&pillar);
        manager.tick(0.1);
        assert_eq!(nav.batch_count(), 1);

        manager.unregister_agent(&*pillar);
        manager.tick(0.1);
        assert_eq!(nav.batch_count(), 1);
    }

    #[test]
    fn test_proximity_precedes_steering() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let backend = ProbeBackend { seen: seen.clone() };
        let mut manager = CrowdManager::with_backend(config(), Box::new(backend));
        let nav = open_grid();
        manager.set_nav_data(nav.clone());

        let a = TestAgent::new(Vec3::new(2.0, 0.0, 2.0));
        let b = TestAgent::new(Vec3::new(2.3, 0.0, 2.0));
        manager.register_agent(&a.handle());
        manager.register_agent(&b.handle());
        manager.tick(0.1);

        // Neighbours are in place and steering has not run yet
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        for (neighbours, dvel) in seen {
            assert_eq!(neighbours, 1);
            assert_eq!(dvel, Vec3::ZERO);
        }

        // Separation then pushes the overlapping agents apart
        let dvel_a = engine_agent(&manager, &*a).dvel;
        assert!(dvel_a.x < 0.0);
        assert_eq!(manager.num_nearby_agents(&*a), 1);
    }

    #[test]
    fn test_nearby_agent_locations() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        let a = TestAgent::new(center(4, 4));
        let b = TestAgent::new(center(5, 4));
        let far = TestAgent::new(center(9, 9));
        for agent in [&a, &b, &far] {
            manager.register_agent(&agent.handle());
        }
        manager.tick(0.1);

        let nearby = manager.nearby_agent_locations(&*a);
        assert_eq!(nearby.len(), 1);
        assert!(dist_2d(nearby[0], center(5, 4)) < 1e-3);
        assert_eq!(manager.num_nearby_agents(&*far), 0);

        let stranger = TestAgent::new(center(4, 4));
        assert_eq!(manager.num_nearby_agents(&*stranger), 0);
        assert!(manager.nearby_agent_locations(&*stranger).is_empty());
    }

    #[test]
    fn test_pause_and_resume() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        let agent = TestAgent::new(center(0, 0));
        manager.register_agent(&agent.handle());
        assert!(manager.set_agent_move_target(&*agent, center(8, 0), None));
        run(&mut manager, &[&agent], 3, 0.1);
        assert!(agent.last_velocity().unwrap().length() > 0.0);

        let before = engine_agent(&manager, &*agent).corridor.get_path().to_vec();
        assert!(manager.pause_agent(&*agent));
        manager.tick(0.1);
        assert_eq!(agent.last_velocity(), Some(Vec3::ZERO));
        assert_eq!(
            engine_agent(&manager, &*agent).state,
            CrowdAgentState::Waiting
        );

        assert!(manager.set_agent_move_target(&*agent, center(0, 8), None));
        assert!(manager.resume_agent(&*agent, true));
        manager.tick(0.1);

        let ag = engine_agent(&manager, &*agent);
        assert_eq!(ag.state, CrowdAgentState::Walking);
        assert_ne!(ag.corridor.get_path(), before.as_slice());
        assert_eq!(ag.corridor.get_last_poly(), nav.mesh.cell_ref(0, 8));
    }

    #[test]
    fn test_new_request_wakes_paused_agent() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        let agent = TestAgent::new(center(0, 0));
        manager.register_agent(&agent.handle());
        assert!(manager.set_agent_move_target(&*agent, center(8, 0), None));
        run(&mut manager, &[&agent], 3, 0.1);
        assert!(manager.pause_agent(&*agent));
        manager.tick(0.1);

        assert!(manager.set_agent_move_target(&*agent, center(0, 8), None));
        assert_eq!(
            engine_agent(&manager, &*agent).state,
            CrowdAgentState::Walking
        );
        run(&mut manager, &[&agent], 3, 0.1);
        assert!(agent.last_velocity().unwrap().length() > 0.0);

        assert!(manager.pause_agent(&*agent));
        manager.tick(0.1);
        assert_eq!(agent.last_velocity(), Some(Vec3::ZERO));

        assert!(manager.set_agent_move_direction(&*agent, Vec3::X));
        run(&mut manager, &[&agent], 2, 0.1);
        assert_eq!(
            engine_agent(&manager, &*agent).state,
            CrowdAgentState::Walking
        );
        assert!(agent.last_velocity().unwrap().x > 0.0);
    }

    #[test]
    fn test_dropped_agents_release_their_slots() {
        let nav = open_grid();
        let mut manager = CrowdManager::new(config().with_max_agents(4));
        manager.set_nav_data(nav.clone());

        for x in 0..5 {
            let agent = TestAgent::new(center(x, 0));
            assert!(manager.register_agent(&agent.handle()));
            assert!(manager.agent_index(&*agent).is_some());
            assert_eq!(manager.active_agent_count(), 1);
        }
        assert_eq!(manager.registered_agent_count(), 1);

        manager.tick(0.1);
        assert_eq!(manager.registered_agent_count(), 0);
        assert_eq!(manager.active_agent_count(), 0);
        assert_eq!(nav.batch_count(), 0);

        let live = TestAgent::new(center(5, 5));
        assert!(manager.register_agent(&live.handle()));
        assert!(manager.agent_index(&*live).is_some());
    }

    #[test]
    fn test_clear_move_target() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        let agent = TestAgent::new(center(0, 0));
        manager.register_agent(&agent.handle());
        manager.set_agent_move_target(&*agent, center(6, 0), None);
        run(&mut manager, &[&agent], 3, 0.1);

        assert!(manager.clear_agent_move_target(&*agent));
        let ag = engine_agent(&manager, &*agent);
        assert_eq!(ag.target_state, MoveRequestState::None);
        assert_eq!(ag.nvel, Vec3::ZERO);
        assert_eq!(ag.vel, Vec3::ZERO);
    }

    #[test]
    fn test_rebuild_keeps_registered_agents() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        let walker = TestAgent::new(center(1, 1));
        let pillar: Arc<dyn CrowdAgent> = Arc::new(Pillar(center(6, 6)));
        manager.register_agent(&walker.handle());
        manager.register_agent(&pillar);

        manager.on_nav_data_updated();

        assert!(manager.is_ready());
        assert_eq!(manager.active_agent_count(), 2);
        assert!(manager.is_agent_valid(&*walker));
        assert!(manager.is_agent_valid(&*pillar));
        assert!(manager.is_agent_simulated(&*walker));
        assert!(!manager.is_agent_simulated(&*pillar));
        assert!(manager.agent_index(&*walker).is_some());
    }

    #[test]
    fn test_set_config_rebuilds_with_new_capacity() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        let a = TestAgent::new(center(1, 1));
        let b = TestAgent::new(center(3, 3));
        manager.register_agent(&a.handle());
        manager.register_agent(&b.handle());

        manager.set_config(config().with_max_agents(1));
        assert_eq!(manager.active_agent_count(), 1);
        let valid = [&*a, &*b]
            .into_iter()
            .filter(|agent| manager.is_agent_valid(*agent))
            .count();
        assert_eq!(valid, 1);
        assert_eq!(manager.registered_agent_count(), 2);
    }

    #[test]
    fn test_engine_flags_update_live_crowd() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        manager.set_offmesh_connection_pruning(true);
        manager.set_single_area_visibility_optimization(false);

        let crowd = manager.crowd().unwrap();
        assert!(crowd.config().prune_started_offmesh_connections);
        assert!(!crowd.config().single_area_visibility_optimization);
        assert!(manager.config().prune_started_offmesh_connections);
    }

    #[test]
    fn test_obstacles_get_no_callbacks() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        let walker = TestAgent::new(center(1, 1));
        let obstacle = TestAgent::obstacle(center(3, 1));
        manager.register_agent(&walker.handle());
        manager.register_agent(&obstacle.handle());
        manager.set_agent_move_target(&*walker, center(6, 1), None);

        run(&mut manager, &[&walker, &obstacle], 10, 0.1);

        assert!(!walker.events().is_empty());
        assert!(obstacle.events().is_empty());
    }

    #[test]
    fn test_collision_resolution_reports_positions() {
        let nav = open_grid();
        let mut manager = CrowdManager::new(config().with_resolve_collisions(true));
        manager.set_nav_data(nav.clone());
        let a = TestAgent::new(Vec3::new(4.9, 0.0, 4.5));
        let b = TestAgent::new(Vec3::new(5.1, 0.0, 4.5));
        manager.register_agent(&a.handle());
        manager.register_agent(&b.handle());

        manager.tick(0.1);

        assert!(a.events().iter().any(|e| matches!(e, Event::Position(_))));
        assert!(dist_2d(a.location(), b.location()) > 0.2);
    }

    #[test]
    fn test_without_collision_resolution_no_positions() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        let a = TestAgent::new(Vec3::new(4.9, 0.0, 4.5));
        let b = TestAgent::new(Vec3::new(5.1, 0.0, 4.5));
        manager.register_agent(&a.handle());
        manager.register_agent(&b.handle());

        manager.tick(0.1);

        assert!(!a.events().iter().any(|e| matches!(e, Event::Position(_))));
        assert_eq!(a.location(), Vec3::new(4.9, 0.0, 4.5));
    }

    #[test]
    fn test_custom_link_handed_to_agent() {
        let mesh = GridNavMesh::new(5, 1, 1.0)
            .with_blocked(2, 0)
            .with_link((1, 0), (3, 0), 42);
        let nav = GridNavData::with_custom_links(mesh);
        let mut manager = manager_on(&nav);
        let agent = TestAgent::new(center(0, 0));
        manager.register_agent(&agent.handle());
        assert!(manager.set_agent_move_target(&*agent, center(4, 0), None));

        run(&mut manager, &[&agent], 30, 0.1);

        let links: Vec<Event> = agent
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::CustomLink { .. }))
            .collect();
        assert_eq!(
            links,
            vec![Event::CustomLink {
                link_id: 42,
                dest: center(3, 0)
            }]
        );
        assert!(matches!(
            agent.events().last(),
            Some(Event::Velocity { using_link: true, .. })
        ));
        assert_eq!(agent.last_velocity(), Some(Vec3::ZERO));
        assert_eq!(
            engine_agent(&manager, &*agent).state,
            CrowdAgentState::Waiting
        );
        let link = nav.mesh.link_ref(0);
        assert!(agent.events().iter().any(|e| matches!(
            e,
            Event::NodeChanged { new_poly, .. } if *new_poly == link
        )));

        agent.set_location(center(3, 0));
        assert!(manager.on_agent_finished_custom_link(&*agent));
        let ag = engine_agent(&manager, &*agent);
        assert_eq!(ag.state, CrowdAgentState::Walking);
        assert_eq!(ag.corridor.get_first_poly(), nav.mesh.cell_ref(3, 0));

        run(&mut manager, &[&agent], 20, 0.1);
        assert!(dist_2d(agent.location(), center(4, 0)) < 0.3);
    }

    #[test]
    fn test_plain_link_animates_in_engine() {
        let mesh = GridNavMesh::new(5, 1, 1.0)
            .with_blocked(2, 0)
            .with_link((1, 0), (3, 0), 7);
        let nav = GridNavData::new(mesh);
        let mut manager = manager_on(&nav);
        let agent = TestAgent::new(center(0, 0));
        manager.register_agent(&agent.handle());
        manager.set_agent_move_target(&*agent, center(4, 0), None);

        run(&mut manager, &[&agent], 60, 0.1);

        assert!(!agent.events().iter().any(|e| matches!(e, Event::CustomLink { .. })));
        assert!(
            agent
                .events()
                .iter()
                .any(|e| matches!(e, Event::Velocity { using_link: true, .. }))
        );
        assert!(agent.location().x > 3.0);
    }

    #[test]
    fn test_null_backend_is_never_ready() {
        let nav = open_grid();
        let mut manager = CrowdManager::with_backend(config(), Box::new(NullBackend));
        manager.set_nav_data(nav.clone());
        let agent = TestAgent::new(center(1, 1));

        assert!(manager.register_agent(&agent.handle()));
        assert!(manager.is_agent_valid(&*agent));
        assert!(!manager.is_ready());
        assert!(!manager.set_agent_move_target(&*agent, center(4, 4), None));
        assert!(!manager.pause_agent(&*agent));
        assert!(!manager.update_agent_params(&*agent));
        assert_eq!(manager.num_nearby_agents(&*agent), 0);

        manager.tick(0.1);
        assert_eq!(nav.batch_count(), 0);
        assert!(agent.events().is_empty());
    }

    #[test]
    fn test_tick_observer_runs_after_each_tick() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        let agent = TestAgent::new(center(1, 1));
        manager.register_agent(&agent.handle());

        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        manager.set_tick_observer(move |m| {
            assert_eq!(m.registered_agent_count(), 1);
            seen.set(seen.get() + 1);
        });
        manager.tick(0.1);
        manager.tick(0.1);
        assert_eq!(calls.get(), 2);

        manager.clear_tick_observer();
        manager.tick(0.1);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_update_agent_params_and_state() {
        let nav = open_grid();
        let mut manager = manager_on(&nav);
        let agent = TestAgent::new(center(1, 1));
        manager.register_agent(&agent.handle());
        assert!(manager.update_agent_params(&*agent));
        assert!(manager.update_agent_state(&*agent, false));

        let ag = engine_agent(&manager, &*agent);
        assert_eq!(ag.params.collision_query_range, 3.0);
        assert_eq!(ag.params.height, 2.0);
        assert!(ag.params.update_flags.contains(UpdateFlags::SLOWDOWN_AT_GOAL));

        let stranger = TestAgent::new(center(1, 1));
        assert!(!manager.update_agent_params(&*stranger));
        assert!(!manager.update_agent_state(&*stranger, true));
    }
}
