#[cfg(test)]
mod tests {
    use crate::aggregator::{FilterRule, RobustAggregator};
    use crate::attack::AttackKind;
    use crate::config::{Algorithm, Config};
    use crate::env::make_env;
    use crate::metrics::DetectionScores;
    use crate::nn::Activation;
    use crate::optim::Adam;
    use crate::params::ParamVec;
    use crate::policy::{CategoricalMlp, Policy};
    use crate::rng::Rng;
    use crate::rollout::{EnvSampler, RolloutConfig};
    use crate::trainer::Trainer;
    use crate::updater::{InnerBudget, InnerLoopConfig, VarianceReducedUpdater};
    use crate::worker::WorkerPool;

    fn flat(v: Vec<f64>) -> ParamVec {
        ParamVec::new(vec![vec![v.len()]], vec![v]).unwrap()
    }

    #[test]
    fn identical_gradients_are_all_trusted() {
        let g = flat(vec![0.3, -0.1, 0.7, 0.0]);
        let grads = vec![g.clone(); 5];
        let agg = RobustAggregator::new(0.06, 0.6, 0.4).unwrap().aggregate(&grads, 16).unwrap();
        assert_eq!(agg.rule, FilterRule::R1);
        assert_eq!(agg.good_count(), 5);
        let mu = agg.control_variate.unwrap();
        assert!(mu.distance(&g).unwrap() < 1e-12);
    }

    #[test]
    fn far_byzantine_pair_is_flagged() {
        let dim = 20;
        let mut rng = Rng::from_seed(11);
        let base: Vec<f64> = (0..dim).map(|_| rng.next_f64_normal()).collect();
        let honest: Vec<ParamVec> = (0..3)
            .map(|_| flat(base.iter().map(|b| b + 1e-3 * rng.next_f64_normal()).collect()))
            .collect();
        let honest_mean = ParamVec::mean(&honest).unwrap();

        let mut attacker = honest_mean.clone();
        attacker.add_scaled(&flat(rng.unit_direction(dim)), 100.0).unwrap();

        let mut grads = vec![attacker.clone(), attacker];
        grads.extend(honest);
        let labels: Vec<bool> = (0..5).map(|i| i < 2).collect();

        let agg = RobustAggregator::new(0.06, 0.6, 0.4).unwrap().aggregate(&grads, 16).unwrap();
        assert_eq!(agg.rule, FilterRule::R1);
        assert_eq!(agg.good_set, labels.iter().map(|b| !b).collect::<Vec<_>>());
        assert!(agg.control_variate.unwrap().distance(&honest_mean).unwrap() < 1e-9);

        let scores = DetectionScores::compute(&labels, &agg.good_set);
        assert_eq!(scores.precision, 1.0);
        assert_eq!(scores.recall, 1.0);
    }

    #[test]
    fn degenerate_round_still_takes_one_step() {
        let grads: Vec<ParamVec> = (0..4).map(|i| flat(vec![i as f64, 0.0])).collect();
        let agg = RobustAggregator::new(1e-6, 0.6, 0.4).unwrap().aggregate(&grads, 16).unwrap();
        assert_eq!(agg.rule, FilterRule::Degenerate);
        assert!(agg.control_variate.is_none());
        assert!(agg.good_set.iter().all(|g| !g));

        let master = CategoricalMlp::new(4, &[8], 2, Activation::Relu, 1).unwrap();
        let old = master.replicate();
        let before = master.get_parameters();
        let mut opt = Adam::new(master.parameters(), 1e-2);
        let mut sampler = EnvSampler::new(make_env("CartPole-v1").unwrap(), RolloutConfig::new(0.99, 40, true));
        let updater = VarianceReducedUpdater::new(InnerLoopConfig::new(2, InnerBudget::Geometric)).unwrap();

        let out = updater
            .update(&master, &old, &mut opt, None, 16, &mut sampler, &mut Rng::from_seed(3))
            .unwrap();
        assert_eq!(out.steps, 1);
        assert!(out.fallback);
        assert_eq!(opt.steps_taken(), 1);
        assert_ne!(master.get_parameters(), before);
        assert_eq!(old.get_parameters(), before);
    }

    fn federation(attack: AttackKind) -> Config {
        Config {
            num_worker: 5,
            num_byzantine: 1,
            attack_type: attack,
            hidden_units: vec![8],
            batch_size_min: 2,
            batch_size_max: 3,
            mini_batch: 1,
            max_epi_len: 25,
            max_trajectories: 4,
            val_size: 0,
            no_saving: true,
            ..Config::default()
        }
    }

    #[test]
    fn sign_flipping_federation_reports_detection() {
        let pool = WorkerPool::new(2, 0).unwrap();
        let mut trainer = Trainer::new(&federation(AttackKind::SignFlipping), 0, 21).unwrap();
        let log = trainer.run(&pool, &mut []).unwrap();
        for round in &log.rounds {
            assert!(round.detection.is_some());
            assert!(round.threshold.unwrap() > 0.0);
            assert!(round.good_count <= 5);
            assert!(round.val_return.is_none());
            assert!(round.mean_grad.is_finite());
        }
    }

    #[test]
    fn variance_attack_federation_runs_to_budget() {
        let pool = WorkerPool::new(2, 0).unwrap();
        let config = federation(AttackKind::VarianceAttack);
        let mut trainer = Trainer::new(&config, 0, 8).unwrap();
        let log = trainer.run(&pool, &mut []).unwrap();
        assert!(log.last_step() > config.max_trajectories);
        assert!(trainer.master().get_parameters().is_finite());
    }

    #[test]
    fn same_seed_same_run() {
        let pool = WorkerPool::new(3, 0).unwrap();
        let config = Config {
            algorithm: Algorithm::Svrpg,
            batch_size: 2,
            inner_steps: 2,
            ..federation(AttackKind::None)
        };
        let a = Trainer::new(&config, 0, 99).unwrap().run(&pool, &mut []).unwrap();
        let b = Trainer::new(&config, 0, 99).unwrap().run(&pool, &mut []).unwrap();
        assert_eq!(a.rounds.len(), b.rounds.len());
        for (x, y) in a.rounds.iter().zip(&b.rounds) {
            assert_eq!(x.step, y.step);
            assert_eq!(x.mean_return, y.mean_return);
            assert_eq!(x.mean_grad, y.mean_grad);
        }
    }
}
