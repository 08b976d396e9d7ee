/// 测试数据库播种工具
/// 用于创建固定的题库数据，确保测试环境的可重复性
use crate::aggregate_sync::AggregateSyncService;
use crate::error::QbankResult;
use crate::models::{CreateQuestionParams, Group, Question, Subtheme, Theme};
use crate::repos::TaxonomyRepo;

/// 固定题库：
/// - Trauma → Fraturas → Classificação（10 题）/ Tratamento（5 题）
/// - Trauma → Fraturas 直属（3 题）
/// - Cardiologia 直属（4 题）
pub struct FractureBank {
    pub trauma: Theme,
    pub fraturas: Subtheme,
    pub classificacao: Group,
    pub tratamento: Group,
    pub cardio: Theme,
    pub questions: Vec<Question>,
    pub cardio_questions: usize,
}

impl FractureBank {
    pub fn in_group<'a>(&'a self, group: &'a Group) -> impl Iterator<Item = &'a Question> + 'a {
        self.questions
            .iter()
            .filter(move |q| q.group_id.as_deref() == Some(group.id.as_str()))
    }
}

fn params(
    title: String,
    theme: &Theme,
    subtheme: Option<&Subtheme>,
    group: Option<&Group>,
) -> CreateQuestionParams {
    CreateQuestionParams {
        title,
        question_text: "Enunciado de teste".to_string(),
        explanation: None,
        theme_id: theme.id.clone(),
        subtheme_id: subtheme.map(|s| s.id.clone()),
        group_id: group.map(|g| g.id.clone()),
    }
}

/// 播种固定题库，题目经由同步服务写入（主表 + 聚合索引）
pub async fn seed_fracture_bank(sync: &AggregateSyncService) -> QbankResult<FractureBank> {
    let db = sync.database();
    let trauma = Theme::new("Trauma");
    let cardio = Theme::new("Cardiologia");
    let fraturas = Subtheme::new(&trauma.id, "Fraturas");
    let classificacao = Group::new(&fraturas.id, "Classificação");
    let tratamento = Group::new(&fraturas.id, "Tratamento");

    TaxonomyRepo::create_theme(db, &trauma)?;
    TaxonomyRepo::create_theme(db, &cardio)?;
    TaxonomyRepo::create_subtheme(db, &fraturas)?;
    TaxonomyRepo::create_group(db, &classificacao)?;
    TaxonomyRepo::create_group(db, &tratamento)?;

    let mut plan = Vec::new();
    for i in 0..10 {
        plan.push(params(
            format!("Classificação {}", i),
            &trauma,
            Some(&fraturas),
            Some(&classificacao),
        ));
    }
    for i in 0..5 {
        plan.push(params(
            format!("Tratamento {}", i),
            &trauma,
            Some(&fraturas),
            Some(&tratamento),
        ));
    }
    for i in 0..3 {
        plan.push(params(format!("Fraturas {}", i), &trauma, Some(&fraturas), None));
    }
    let cardio_questions = 4;
    for i in 0..cardio_questions {
        plan.push(params(format!("Cardiologia {}", i), &cardio, None, None));
    }

    let mut questions = Vec::with_capacity(plan.len());
    for p in &plan {
        let (question, _report) = sync.create_question(p).await?;
        questions.push(question);
    }

    Ok(FractureBank {
        trauma,
        fraturas,
        classificacao,
        tratamento,
        cardio,
        questions,
        cardio_questions,
    })
}

/// 在单个 theme 下播种 `count` 道题目
pub async fn seed_flat_corpus(sync: &AggregateSyncService, count: usize) -> QbankResult<Vec<Question>> {
    let theme = Theme::new("Clínica Geral");
    TaxonomyRepo::create_theme(sync.database(), &theme)?;

    let mut questions = Vec::with_capacity(count);
    for i in 0..count {
        let (question, _report) = sync
            .create_question(&params(format!("Questão {}", i), &theme, None, None))
            .await?;
        questions.push(question);
    }
    Ok(questions)
}
