//! Candidate output configurations
//!
//! [`Combinations`] walks all assignments of connectors to crtcs (and primary planes on atomic
//! devices) in the order they should be tested: assignments driving more connectors first, and
//! among those the ones matching more of the state already programmed in hardware.
//!
//! Every `(connectors, live)` class is explored by its own depth-first pass, so nothing beyond
//! the current path is ever materialized and the search stops as soon as the caller stops
//! pulling candidates.

use std::rc::Rc;

use crate::backend::drm::object::{ConnectorProp, DrmConnector, DrmCrtc, DrmPlane, PlaneType};

/// One connector bound to a crtc and, on atomic devices, a primary plane
#[derive(Debug, Clone)]
pub struct Assignment {
    /// The connector
    pub connector: Rc<DrmConnector>,
    /// The crtc driving it
    pub crtc: Rc<DrmCrtc>,
    /// The primary plane of the crtc
    pub plane: Option<Rc<DrmPlane>>,
}

impl Assignment {
    /// Whether the hardware already drives the connector through this crtc and plane
    pub fn is_live(&self) -> bool {
        is_live(&self.connector, &self.crtc, self.plane.as_deref())
    }
}

fn is_live(connector: &DrmConnector, crtc: &DrmCrtc, plane: Option<&DrmPlane>) -> bool {
    connector.object().current(ConnectorProp::CrtcId as usize) == Some(crtc.id() as u64)
        && plane.map(|plane| plane.current_crtc() == crtc.id() as u64).unwrap_or(true)
}

#[derive(Debug, Clone, Copy)]
struct Choice {
    crtc: usize,
    plane: Option<usize>,
    live: bool,
}

#[derive(Debug)]
struct Frame {
    connector: usize,
    candidates: Vec<Choice>,
    // index of the next candidate, `candidates.len()` stands for skipping the connector
    next: usize,
    chosen: Option<Choice>,
}

/// Lazy iterator over candidate assignments, in test order
///
/// Never yields an empty assignment. Connectors without a free compatible crtc are left out
/// instead of failing the whole candidate.
#[derive(Debug)]
pub struct Combinations<'a> {
    connectors: &'a [Rc<DrmConnector>],
    crtcs: &'a [Rc<DrmCrtc>],
    planes: &'a [Rc<DrmPlane>],
    atomic: bool,
    target: usize,
    live_target: usize,
    stack: Vec<Frame>,
    used_crtcs: Vec<bool>,
    used_planes: Vec<bool>,
    assigned: usize,
    live: usize,
    started: bool,
}

impl<'a> Combinations<'a> {
    /// Enumerate the assignments of `connectors` to `crtcs` and `planes`
    ///
    /// Without `atomic` no planes are assigned.
    pub fn new(
        connectors: &'a [Rc<DrmConnector>],
        crtcs: &'a [Rc<DrmCrtc>],
        planes: &'a [Rc<DrmPlane>],
        atomic: bool,
    ) -> Combinations<'a> {
        let target = connectors.len().min(crtcs.len());
        Combinations {
            connectors,
            crtcs,
            planes,
            atomic,
            target,
            live_target: target,
            stack: Vec::new(),
            used_crtcs: vec![false; crtcs.len()],
            used_planes: vec![false; planes.len()],
            assigned: 0,
            live: 0,
            started: false,
        }
    }

    fn candidates(&self, connector: usize) -> Vec<Choice> {
        let connector_ref = &self.connectors[connector];
        let mut candidates = Vec::new();
        for (crtc_index, crtc) in self.crtcs.iter().enumerate() {
            if self.used_crtcs[crtc_index] || !connector_ref.is_crtc_supported(crtc.pipe_index()) {
                continue;
            }
            if !self.atomic {
                candidates.push(Choice {
                    crtc: crtc_index,
                    plane: None,
                    live: is_live(connector_ref, crtc, None),
                });
                continue;
            }
            for (plane_index, plane) in self.planes.iter().enumerate() {
                if self.used_planes[plane_index]
                    || plane.plane_type() != PlaneType::Primary
                    || !plane.is_crtc_supported(crtc.pipe_index())
                {
                    continue;
                }
                candidates.push(Choice {
                    crtc: crtc_index,
                    plane: Some(plane_index),
                    live: is_live(connector_ref, crtc, Some(plane)),
                });
            }
        }
        candidates
    }

    fn push_frame(&mut self, connector: usize) {
        let candidates = self.candidates(connector);
        self.stack.push(Frame {
            connector,
            candidates,
            next: 0,
            chosen: None,
        });
    }

    fn apply(&mut self, choice: Choice) {
        self.used_crtcs[choice.crtc] = true;
        if let Some(plane) = choice.plane {
            self.used_planes[plane] = true;
        }
        self.assigned += 1;
        self.live += choice.live as usize;
    }

    fn undo(&mut self, choice: Choice) {
        self.used_crtcs[choice.crtc] = false;
        if let Some(plane) = choice.plane {
            self.used_planes[plane] = false;
        }
        self.assigned -= 1;
        self.live -= choice.live as usize;
    }

    // move on to the next (connectors, live) class
    fn next_pass(&mut self) -> bool {
        if !self.started {
            self.started = true;
        } else if self.live_target > 0 {
            self.live_target -= 1;
        } else {
            self.target = self.target.saturating_sub(1);
            self.live_target = self.target;
        }
        if self.target == 0 || self.connectors.is_empty() {
            return false;
        }
        self.push_frame(0);
        true
    }

    fn collect(&self) -> Vec<Assignment> {
        self.stack
            .iter()
            .filter_map(|frame| frame.chosen.map(|choice| (frame.connector, choice)))
            .map(|(connector, choice)| Assignment {
                connector: self.connectors[connector].clone(),
                crtc: self.crtcs[choice.crtc].clone(),
                plane: choice.plane.map(|plane| self.planes[plane].clone()),
            })
            .collect()
    }
}

impl<'a> Iterator for Combinations<'a> {
    type Item = Vec<Assignment>;

    fn next(&mut self) -> Option<Vec<Assignment>> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                if !self.next_pass() {
                    return None;
                }
                continue;
            };

            if let Some(previous) = frame.chosen.take() {
                self.undo(previous);
            }
            let Some(frame) = self.stack.last_mut() else {
                continue;
            };
            if frame.next > frame.candidates.len() {
                self.stack.pop();
                continue;
            }

            let connector = frame.connector;
            let choice = frame.candidates.get(frame.next).copied();
            frame.next += 1;
            frame.chosen = choice;
            if let Some(choice) = choice {
                self.apply(choice);
            }

            let remaining = self.connectors.len() - connector - 1;
            if self.assigned > self.target
                || self.assigned + remaining < self.target
                || self.live > self.live_target
                || self.live + remaining < self.live_target
            {
                // the next iteration undoes the choice
                continue;
            }

            if remaining == 0 {
                if self.assigned == self.target && self.live == self.live_target {
                    return Some(Combinations::collect(self));
                }
                continue;
            }
            self.push_frame(connector + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::Combinations;
    use crate::backend::drm::{
        device::{
            dummy::{test_mode, DummyDevice, DummyPlaneType},
            KmsDevice,
        },
        object::{DrmConnector, DrmCrtc, DrmPlane},
    };

    struct Topology {
        dummy: Rc<DummyDevice>,
        connectors: Vec<Rc<DrmConnector>>,
        crtcs: Vec<Rc<DrmCrtc>>,
        planes: Vec<Rc<DrmPlane>>,
    }

    // `masks` holds the possible crtcs of every connector
    fn topology(masks: &[u32], crtcs: usize) -> Topology {
        let dummy = Rc::new(DummyDevice::new());
        let crtc_handles: Vec<_> = (0..crtcs).map(|_| dummy.add_crtc()).collect();
        let plane_handles: Vec<_> = (0..crtcs)
            .map(|i| dummy.add_plane(DummyPlaneType::Primary, 1 << i, false))
            .collect();
        let connector_handles: Vec<_> = masks
            .iter()
            .map(|mask| dummy.add_connector(vec![test_mode(640, 480, 60, true)], *mask))
            .collect();
        let device: Rc<dyn KmsDevice> = dummy.clone();
        Topology {
            connectors: connector_handles
                .into_iter()
                .map(|handle| DrmConnector::new(device.clone(), handle, true).unwrap())
                .collect(),
            crtcs: crtc_handles
                .into_iter()
                .enumerate()
                .map(|(i, handle)| DrmCrtc::new(device.clone(), handle, i, true).unwrap())
                .collect(),
            planes: plane_handles
                .into_iter()
                .map(|handle| DrmPlane::new(device.clone(), handle).unwrap())
                .collect(),
            dummy,
        }
    }

    #[test]
    fn most_connectors_first() {
        let topology = topology(&[0b11, 0b11], 2);
        let all: Vec<_> = Combinations::new(&topology.connectors, &topology.crtcs, &topology.planes, true).collect();

        // two full assignments, then every single connector on either crtc
        assert_eq!(all.len(), 2 + 4);
        assert!(all[..2].iter().all(|assignment| assignment.len() == 2));
        assert!(all[2..].iter().all(|assignment| assignment.len() == 1));
        assert!(all.iter().all(|assignment| !assignment.is_empty()));
        for assignment in &all[..2] {
            assert!(!Rc::ptr_eq(&assignment[0].crtc, &assignment[1].crtc));
            for item in assignment {
                assert!(item.plane.as_ref().unwrap().is_crtc_supported(item.crtc.pipe_index()));
            }
        }
    }

    #[test]
    fn live_assignments_first() {
        let topology = topology(&[0b11], 2);
        let second = &topology.crtcs[1];
        topology
            .dummy
            .set_value(topology.connectors[0].id(), "CRTC_ID", second.id() as u64);
        topology
            .dummy
            .set_value(topology.planes[1].id(), "CRTC_ID", second.id() as u64);
        topology.connectors[0].refresh().unwrap();
        topology.planes[1].object().update_properties().unwrap();

        let first = Combinations::new(&topology.connectors, &topology.crtcs, &topology.planes, true)
            .next()
            .unwrap();
        assert!(Rc::ptr_eq(&first[0].crtc, second));
        assert!(first[0].is_live());
    }

    #[test]
    fn unassignable_connectors_are_skipped() {
        // the first connector has no usable crtc at all
        let topology = topology(&[0b100, 0b01], 2);
        let all: Vec<_> = Combinations::new(&topology.connectors, &topology.crtcs, &topology.planes, true).collect();
        assert_eq!(all.len(), 1);
        assert!(Rc::ptr_eq(&all[0][0].connector, &topology.connectors[1]));
    }

    #[test]
    fn legacy_assigns_no_planes() {
        let topology = topology(&[0b1], 1);
        let all: Vec<_> = Combinations::new(&topology.connectors, &topology.crtcs, &topology.planes, false).collect();
        assert_eq!(all.len(), 1);
        assert!(all[0][0].plane.is_none());
    }

    #[test]
    fn empty_inputs() {
        let no_connectors = topology(&[], 2);
        assert!(Combinations::new(
            &no_connectors.connectors,
            &no_connectors.crtcs,
            &no_connectors.planes,
            true
        )
        .next()
        .is_none());
        let no_crtcs = topology(&[0b1], 0);
        assert!(Combinations::new(&no_crtcs.connectors, &no_crtcs.crtcs, &no_crtcs.planes, true)
            .next()
            .is_none());
    }
}
